//! Read side of the dispatch path: API key lookup, routing snapshot, and
//! targeted counter updates.

use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Expr;
use sea_orm::{EntityTrait, ExprTrait, QueryFilter};
use time::OffsetDateTime;

use crate::GatewayStorage;
use crate::entities::{
    self, api_keys, global_models, model_mappings, models, provider_api_keys,
    provider_endpoints, providers, users,
};

/// Everything the planner needs, loaded in one pass. Rows are entity models;
/// interpretation (globs, capabilities, ranking) happens in the dispatch
/// crate.
#[derive(Debug, Clone, Default)]
pub struct RoutingSnapshot {
    pub providers: Vec<providers::Model>,
    pub endpoints: Vec<provider_endpoints::Model>,
    pub credentials: Vec<provider_api_keys::Model>,
    pub global_models: Vec<global_models::Model>,
    pub models: Vec<models::Model>,
    pub mappings: Vec<model_mappings::Model>,
}

impl GatewayStorage {
    pub async fn find_api_key_by_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<(api_keys::Model, Option<users::Model>)>, DbErr> {
        let Some(key) = entities::ApiKeys::find()
            .filter(api_keys::Column::KeyHash.eq(key_hash))
            .one(self.connection())
            .await?
        else {
            return Ok(None);
        };
        let user = match key.user_id {
            Some(user_id) => {
                entities::Users::find_by_id(user_id)
                    .one(self.connection())
                    .await?
            }
            None => None,
        };
        Ok(Some((key, user)))
    }

    pub async fn touch_api_key(&self, key_id: i64) -> Result<(), DbErr> {
        use api_keys::Column;
        entities::ApiKeys::update_many()
            .col_expr(Column::LastUsedAt, Expr::value(OffsetDateTime::now_utc()))
            .col_expr(
                Column::RequestCount,
                Expr::col(Column::RequestCount).add(1),
            )
            .filter(Column::Id.eq(key_id))
            .exec(self.connection())
            .await?;
        Ok(())
    }

    pub async fn load_routing_snapshot(&self) -> Result<RoutingSnapshot, DbErr> {
        Ok(RoutingSnapshot {
            providers: entities::Providers::find()
                .filter(providers::Column::Enabled.eq(true))
                .all(self.connection())
                .await?,
            endpoints: entities::ProviderEndpoints::find()
                .filter(provider_endpoints::Column::Enabled.eq(true))
                .all(self.connection())
                .await?,
            credentials: entities::ProviderApiKeys::find()
                .filter(provider_api_keys::Column::Enabled.eq(true))
                .all(self.connection())
                .await?,
            global_models: entities::GlobalModels::find()
                .filter(global_models::Column::Enabled.eq(true))
                .all(self.connection())
                .await?,
            models: entities::Models::find()
                .filter(models::Column::Enabled.eq(true))
                .all(self.connection())
                .await?,
            mappings: entities::ModelMappings::find()
                .filter(model_mappings::Column::Enabled.eq(true))
                .all(self.connection())
                .await?,
        })
    }

    /// Quota accounting after settlement: user, key, credential, provider.
    pub async fn apply_cost(
        &self,
        user_id: Option<i64>,
        api_key_id: Option<i64>,
        credential_id: Option<i64>,
        provider_id: Option<i64>,
        cost_usd: f64,
    ) -> Result<(), DbErr> {
        if cost_usd <= 0.0 {
            return Ok(());
        }
        if let Some(user_id) = user_id {
            use users::Column;
            entities::Users::update_many()
                .col_expr(Column::UsedUsd, Expr::col(Column::UsedUsd).add(cost_usd))
                .col_expr(Column::TotalUsd, Expr::col(Column::TotalUsd).add(cost_usd))
                .filter(Column::Id.eq(user_id))
                .exec(self.connection())
                .await?;
        }
        if let Some(key_id) = api_key_id {
            use api_keys::Column;
            entities::ApiKeys::update_many()
                .col_expr(Column::UsedUsd, Expr::col(Column::UsedUsd).add(cost_usd))
                .filter(Column::Id.eq(key_id))
                .exec(self.connection())
                .await?;
        }
        if let Some(credential_id) = credential_id {
            use provider_api_keys::Column;
            entities::ProviderApiKeys::update_many()
                .col_expr(
                    Column::DailyUsedUsd,
                    Expr::col(Column::DailyUsedUsd).add(cost_usd),
                )
                .col_expr(
                    Column::MonthlyUsedUsd,
                    Expr::col(Column::MonthlyUsedUsd).add(cost_usd),
                )
                .filter(Column::Id.eq(credential_id))
                .exec(self.connection())
                .await?;
        }
        if let Some(provider_id) = provider_id {
            use providers::Column;
            entities::Providers::update_many()
                .col_expr(
                    Column::MonthlyUsedUsd,
                    Expr::col(Column::MonthlyUsedUsd).add(cost_usd),
                )
                .filter(Column::Id.eq(provider_id))
                .exec(self.connection())
                .await?;
        }
        Ok(())
    }
}
