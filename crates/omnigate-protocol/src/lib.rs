pub mod claude;
pub mod gemini;
pub mod openai;
pub mod sse;
pub mod usage;

use serde_json::Value;

pub type JsonValue = Value;
pub type JsonObject = serde_json::Map<String, Value>;
