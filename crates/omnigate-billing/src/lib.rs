pub mod dimensions;
pub mod engine;
pub mod expr;
pub mod pricing;
pub mod rules;

pub use dimensions::{CollectInput, CollectorSpec, DimValue, SourceType, ValueType, collect_dimensions};
pub use engine::{
    BillingError, DimensionMapping, EvaluationOutcome, EvaluationStatus, FormulaEngine,
    MappingSource, PriceTierMapping,
};
pub use expr::{BindingValue, ExprError, SafeExpression, extract_variable_names};
pub use pricing::{CostBreakdown, PriceTier, TieredPricing, compute_token_cost};
pub use rules::{BillingRuleSnapshot, RuleScope, pick_rule};
