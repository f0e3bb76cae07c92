pub mod auth;
pub mod client;
pub mod codex;
pub mod error;
pub mod limits;
pub mod pipeline;
pub mod planner;
pub mod signature_cache;
pub mod transport;
pub mod types;

pub use error::DispatchError;
pub use limits::{KeyGuard, KeyLimiter};
pub use pipeline::{DispatchBody, DispatchOutcome, Dispatcher, DispatcherConfig};
pub use planner::{Candidate, plan_candidates};
pub use types::{RequiredCapabilities, ResolvedRequest};
