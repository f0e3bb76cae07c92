//! Usage row retention tiers.
//!
//! Stage 1: move request/response body JSON into gzip blobs.
//! Stage 2: delete the blobs.
//! Stage 3: clear header columns.
//! Stage 4: delete the rows.
//!
//! Every stage runs in bounded batches; a stage abandons its loop after
//! three consecutive zero-progress batches.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, EntityTrait, ExprTrait, QueryFilter, QuerySelect};
use time::OffsetDateTime;
use tracing::{info, warn};

use omnigate_common::RetentionConfig;

use crate::GatewayStorage;
use crate::entities::{self, usage_records};

const MAX_ZERO_PROGRESS: u32 = 3;

pub fn compress_body(body: &Json) -> std::io::Result<Vec<u8>> {
    let serialized = serde_json::to_vec(body)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&serialized)?;
    encoder.finish()
}

pub fn decompress_body(blob: &[u8]) -> std::io::Result<Json> {
    let mut decoder = GzDecoder::new(blob);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    serde_json::from_slice(&raw).map_err(Into::into)
}

impl GatewayStorage {
    /// Run all four retention tiers once. Called from the cleanup schedule.
    pub async fn run_retention(&self, config: &RetentionConfig) -> Result<(), DbErr> {
        if config.compress_bodies_after_days > 0 {
            self.compress_tier(config).await?;
        }
        if config.delete_bodies_after_days > 0 {
            self.delete_blobs_tier(config).await?;
        }
        if config.clear_headers_after_days > 0 {
            self.clear_headers_tier(config).await?;
        }
        if config.delete_rows_after_days > 0 {
            self.delete_rows_tier(config).await?;
        }
        Ok(())
    }

    async fn compress_tier(&self, config: &RetentionConfig) -> Result<(), DbErr> {
        use usage_records::Column;
        let cutoff = OffsetDateTime::now_utc()
            - time::Duration::days(config.compress_bodies_after_days as i64);
        let mut zero_progress = 0u32;
        loop {
            let rows = entities::UsageRecords::find()
                .filter(Column::CreatedAt.lt(cutoff))
                .filter(
                    Column::RequestBody
                        .is_not_null()
                        .or(Column::ResponseBody.is_not_null()),
                )
                .limit(config.batch_size)
                .all(self.connection())
                .await?;
            if rows.is_empty() {
                break;
            }
            let mut progressed = 0u64;
            for row in rows {
                let request_blob = row
                    .request_body
                    .as_ref()
                    .and_then(|body| compress_body(body).ok());
                let response_blob = row
                    .response_body
                    .as_ref()
                    .and_then(|body| compress_body(body).ok());
                let active = usage_records::ActiveModel {
                    request_body: ActiveValue::Set(None),
                    response_body: ActiveValue::Set(None),
                    request_body_compressed: ActiveValue::Set(request_blob),
                    response_body_compressed: ActiveValue::Set(response_blob),
                    updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
                    ..Default::default()
                };
                let result = entities::UsageRecords::update_many()
                    .set(active)
                    .filter(Column::Id.eq(row.id))
                    .exec(self.connection())
                    .await?;
                progressed += result.rows_affected;
            }
            if progressed == 0 {
                zero_progress += 1;
                if zero_progress >= MAX_ZERO_PROGRESS {
                    warn!("retention compress tier made no progress, aborting loop");
                    break;
                }
            } else {
                zero_progress = 0;
                info!(rows = progressed, "retention: compressed usage bodies");
            }
        }
        Ok(())
    }

    async fn delete_blobs_tier(&self, config: &RetentionConfig) -> Result<(), DbErr> {
        use usage_records::Column;
        let cutoff = OffsetDateTime::now_utc()
            - time::Duration::days(config.delete_bodies_after_days as i64);
        self.batched_update(
            config,
            "delete_blobs",
            entities::UsageRecords::find()
                .filter(Column::CreatedAt.lt(cutoff))
                .filter(
                    Column::RequestBodyCompressed
                        .is_not_null()
                        .or(Column::ResponseBodyCompressed.is_not_null()),
                ),
            usage_records::ActiveModel {
                request_body_compressed: ActiveValue::Set(None),
                response_body_compressed: ActiveValue::Set(None),
                ..Default::default()
            },
        )
        .await
    }

    async fn clear_headers_tier(&self, config: &RetentionConfig) -> Result<(), DbErr> {
        use usage_records::Column;
        let cutoff = OffsetDateTime::now_utc()
            - time::Duration::days(config.clear_headers_after_days as i64);
        self.batched_update(
            config,
            "clear_headers",
            entities::UsageRecords::find()
                .filter(Column::CreatedAt.lt(cutoff))
                .filter(
                    Column::RequestHeaders
                        .is_not_null()
                        .or(Column::ResponseHeaders.is_not_null())
                        .or(Column::ProviderRequestHeaders.is_not_null())
                        .or(Column::ClientResponseHeaders.is_not_null()),
                ),
            usage_records::ActiveModel {
                request_headers: ActiveValue::Set(None),
                response_headers: ActiveValue::Set(None),
                provider_request_headers: ActiveValue::Set(None),
                client_response_headers: ActiveValue::Set(None),
                ..Default::default()
            },
        )
        .await
    }

    async fn delete_rows_tier(&self, config: &RetentionConfig) -> Result<(), DbErr> {
        use usage_records::Column;
        let cutoff =
            OffsetDateTime::now_utc() - time::Duration::days(config.delete_rows_after_days as i64);
        let mut zero_progress = 0u32;
        loop {
            let ids: Vec<i64> = entities::UsageRecords::find()
                .filter(Column::CreatedAt.lt(cutoff))
                .limit(config.batch_size)
                .all(self.connection())
                .await?
                .into_iter()
                .map(|row| row.id)
                .collect();
            if ids.is_empty() {
                break;
            }
            let result = entities::UsageRecords::delete_many()
                .filter(Column::Id.is_in(ids))
                .exec(self.connection())
                .await?;
            if result.rows_affected == 0 {
                zero_progress += 1;
                if zero_progress >= MAX_ZERO_PROGRESS {
                    warn!("retention delete tier made no progress, aborting loop");
                    break;
                }
            } else {
                zero_progress = 0;
                info!(rows = result.rows_affected, "retention: deleted usage rows");
            }
        }
        Ok(())
    }

    async fn batched_update(
        &self,
        config: &RetentionConfig,
        tier: &'static str,
        query: sea_orm::Select<entities::UsageRecords>,
        template: usage_records::ActiveModel,
    ) -> Result<(), DbErr> {
        use usage_records::Column;
        let mut zero_progress = 0u32;
        loop {
            let ids: Vec<i64> = query
                .clone()
                .limit(config.batch_size)
                .all(self.connection())
                .await?
                .into_iter()
                .map(|row| row.id)
                .collect();
            if ids.is_empty() {
                break;
            }
            let mut active = template.clone();
            active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
            let result = entities::UsageRecords::update_many()
                .set(active)
                .filter(Column::Id.is_in(ids))
                .exec(self.connection())
                .await?;
            if result.rows_affected == 0 {
                zero_progress += 1;
                if zero_progress >= MAX_ZERO_PROGRESS {
                    warn!(tier, "retention tier made no progress, aborting loop");
                    break;
                }
            } else {
                zero_progress = 0;
                info!(tier, rows = result.rows_affected, "retention tier progressed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_round_trips() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "nested": {"a": [1, 2, 3]}
        });
        let blob = compress_body(&body).unwrap();
        assert!(!blob.is_empty());
        assert_eq!(decompress_body(&blob).unwrap(), body);
    }

    #[test]
    fn corrupt_blob_is_an_error() {
        assert!(decompress_body(b"not gzip").is_err());
    }
}
