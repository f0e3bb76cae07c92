pub mod api_keys;
pub mod billing_rules;
pub mod dimension_collectors;
pub mod global_models;
pub mod model_mappings;
pub mod models;
pub mod provider_api_keys;
pub mod provider_endpoints;
pub mod providers;
pub mod proxy_node_events;
pub mod proxy_nodes;
pub mod request_candidates;
pub mod stats_daily;
pub mod usage_records;
pub mod users;
pub mod video_tasks;

pub use api_keys::Entity as ApiKeys;
pub use billing_rules::Entity as BillingRules;
pub use dimension_collectors::Entity as DimensionCollectors;
pub use global_models::Entity as GlobalModels;
pub use model_mappings::Entity as ModelMappings;
pub use models::Entity as Models;
pub use provider_api_keys::Entity as ProviderApiKeys;
pub use provider_endpoints::Entity as ProviderEndpoints;
pub use providers::Entity as Providers;
pub use proxy_node_events::Entity as ProxyNodeEvents;
pub use proxy_nodes::Entity as ProxyNodes;
pub use request_candidates::Entity as RequestCandidates;
pub use stats_daily::Entity as StatsDaily;
pub use usage_records::Entity as UsageRecords;
pub use users::Entity as Users;
pub use video_tasks::Entity as VideoTasks;
