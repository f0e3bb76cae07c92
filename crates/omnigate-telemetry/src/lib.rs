pub mod consumer;
pub mod events;
pub mod masking;
pub mod writer;

pub use consumer::UsageQueueConsumer;
pub use events::{UsageEvent, UsageEventType, ensure_stream_group};
pub use masking::{mask_headers, truncate_body};
pub use writer::{
    DirectTelemetryWriter, QueueTelemetryWriter, StreamingStarted, TelemetryError,
    TelemetryWriter,
};
