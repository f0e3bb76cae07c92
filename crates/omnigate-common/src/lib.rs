mod config;
mod error;
mod signature;

pub use config::{GatewayConfig, GatewayConfigError, GatewayConfigPatch, RetentionConfig, UsageQueueConfig};
pub use error::{ErrorCategory, FailureTag};
pub use signature::{ApiFamily, EndpointKind, EndpointSignature, SignatureParseError, TaskType};
