pub mod lock;
pub mod poller;
pub mod video;

pub use lock::AdvisoryLock;
pub use poller::{PollerConfig, VideoTaskPoller};
pub use video::{PollDecision, backoff_delay, decide, is_permanent_poll_error};
