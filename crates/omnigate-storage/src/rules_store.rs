//! Billing rule and dimension collector lookups for settlement.

use std::collections::HashMap;

use sea_orm::entity::prelude::*;
use sea_orm::{EntityTrait, QueryFilter};

use omnigate_billing::{
    BillingRuleSnapshot, CollectorSpec, DimensionMapping, RuleScope, dimensions,
};
use omnigate_common::{EndpointSignature, TaskType};

use crate::GatewayStorage;
use crate::entities::{self, billing_rules, dimension_collectors};

fn snapshot_from_row(row: billing_rules::Model, scope: RuleScope) -> BillingRuleSnapshot {
    let constants: HashMap<String, f64> = row
        .constants
        .and_then(|json| serde_json::from_value(json).ok())
        .unwrap_or_default();
    let dimension_mappings: HashMap<String, DimensionMapping> = row
        .dimension_mappings
        .and_then(|json| serde_json::from_value(json).ok())
        .unwrap_or_default();
    BillingRuleSnapshot {
        rule_id: row.id,
        scope,
        task_type: match row.task_type.as_str() {
            "cli" => TaskType::Cli,
            "video" => TaskType::Video,
            "images" => TaskType::Images,
            "embeddings" => TaskType::Embeddings,
            "audio" => TaskType::Audio,
            _ => TaskType::Chat,
        },
        expression: row.expression,
        constants,
        dimension_mappings,
    }
}

fn collector_from_row(row: dimension_collectors::Model) -> Option<CollectorSpec> {
    let source_type = match row.source_type.as_str() {
        "request" => dimensions::SourceType::Request,
        "response" => dimensions::SourceType::Response,
        "metadata" => dimensions::SourceType::Metadata,
        "computed" => dimensions::SourceType::Computed,
        _ => return None,
    };
    let value_type = match row.value_type.as_str() {
        "int" => dimensions::ValueType::Int,
        "string" => dimensions::ValueType::String,
        _ => dimensions::ValueType::Float,
    };
    Some(CollectorSpec {
        dimension_name: row.dimension_name,
        source_type,
        source_path: row.source_path,
        value_type,
        transform_expression: row.transform_expression,
        default_value: row.default_value,
        priority: row.priority,
    })
}

impl GatewayStorage {
    /// The one enabled rule for the scope; Model-level wins over
    /// GlobalModel-level.
    pub async fn find_billing_rule(
        &self,
        model_id: Option<i64>,
        global_model_id: Option<i64>,
        task_type: TaskType,
    ) -> Result<Option<BillingRuleSnapshot>, DbErr> {
        use billing_rules::Column;
        let model_rule = match model_id {
            Some(model_id) => entities::BillingRules::find()
                .filter(Column::ModelId.eq(model_id))
                .filter(Column::TaskType.eq(task_type.as_str()))
                .filter(Column::Enabled.eq(true))
                .one(self.connection())
                .await?
                .map(|row| snapshot_from_row(row, RuleScope::Model)),
            None => None,
        };
        if model_rule.is_some() {
            return Ok(model_rule);
        }
        let global_rule = match global_model_id {
            Some(global_model_id) => entities::BillingRules::find()
                .filter(Column::GlobalModelId.eq(global_model_id))
                .filter(Column::ModelId.is_null())
                .filter(Column::TaskType.eq(task_type.as_str()))
                .filter(Column::Enabled.eq(true))
                .one(self.connection())
                .await?
                .map(|row| snapshot_from_row(row, RuleScope::GlobalModel)),
            None => None,
        };
        Ok(global_rule)
    }

    /// Enabled collectors for one scope. `cli` unions `chat` collectors
    /// per-dimension, cli winning (cli is billing-equivalent to chat).
    pub async fn load_collectors(
        &self,
        signature: EndpointSignature,
        task_type: TaskType,
    ) -> Result<Vec<CollectorSpec>, DbErr> {
        use dimension_collectors::Column;
        let fetch = |task: &'static str| {
            entities::DimensionCollectors::find()
                .filter(Column::ApiFamily.eq(signature.family.as_str()))
                .filter(Column::EndpointKind.eq(signature.kind.as_str()))
                .filter(Column::TaskType.eq(task))
                .filter(Column::Enabled.eq(true))
                .all(self.connection())
        };

        if task_type == TaskType::Cli {
            let cli: Vec<CollectorSpec> = fetch("cli")
                .await?
                .into_iter()
                .filter_map(collector_from_row)
                .collect();
            let chat: Vec<CollectorSpec> = fetch("chat")
                .await?
                .into_iter()
                .filter_map(collector_from_row)
                .collect();
            return Ok(dimensions::union_cli_with_chat(cli, chat));
        }

        Ok(entities::DimensionCollectors::find()
            .filter(Column::ApiFamily.eq(signature.family.as_str()))
            .filter(Column::EndpointKind.eq(signature.kind.as_str()))
            .filter(Column::TaskType.eq(task_type.as_str()))
            .filter(Column::Enabled.eq(true))
            .all(self.connection())
            .await?
            .into_iter()
            .filter_map(collector_from_row)
            .collect())
    }
}
