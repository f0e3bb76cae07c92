pub mod aggregate;
pub mod db;
pub mod entities;
pub mod health_store;
pub mod ledger;
pub mod nodes_store;
pub mod records;
pub mod retention;
pub mod routing;
pub mod rules_store;
pub mod video_store;

use sea_orm::DatabaseConnection;

pub use db::connect_shared;
pub use ledger::CandidateLedgerEntry;
pub use records::{TerminalStatus, UsageRecordInput};
pub use retention::{compress_body, decompress_body};

/// Cloneable storage handle shared by every service in the process.
#[derive(Clone)]
pub struct GatewayStorage {
    connection: DatabaseConnection,
}

impl GatewayStorage {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// Entity-first schema sync, run once at bootstrap.
    pub async fn sync_schema(&self) -> Result<(), sea_orm::DbErr> {
        use sea_orm::{ConnectionTrait, Schema};
        Schema::new(self.connection.get_database_backend())
            .builder()
            .register(entities::Users)
            .register(entities::ApiKeys)
            .register(entities::Providers)
            .register(entities::ProviderEndpoints)
            .register(entities::ProviderApiKeys)
            .register(entities::GlobalModels)
            .register(entities::Models)
            .register(entities::ModelMappings)
            .register(entities::UsageRecords)
            .register(entities::RequestCandidates)
            .register(entities::BillingRules)
            .register(entities::DimensionCollectors)
            .register(entities::ProxyNodes)
            .register(entities::ProxyNodeEvents)
            .register(entities::VideoTasks)
            .register(entities::StatsDaily)
            .sync(&self.connection)
            .await?;
        Ok(())
    }
}
