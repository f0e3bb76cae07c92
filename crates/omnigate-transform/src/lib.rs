pub mod aggregate;
pub mod registry;
pub mod request;
pub mod smoother;
pub mod stream;
pub mod variant;

pub use registry::{ConverterRegistry, StreamConverter, TransformError, convert_request};
pub use smoother::StreamSmoother;
pub use variant::{GeminiCliEnvelope, UrlPool, VariantHook};
