use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error("invalid endpoint signature: {0}")]
pub struct SignatureParseError(pub String);

/// Wire-format family a client or upstream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFamily {
    OpenAI,
    Claude,
    Gemini,
}

impl ApiFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFamily::OpenAI => "openai",
            ApiFamily::Claude => "claude",
            ApiFamily::Gemini => "gemini",
        }
    }
}

impl FromStr for ApiFamily {
    type Err = SignatureParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ApiFamily::OpenAI),
            "claude" | "anthropic" => Ok(ApiFamily::Claude),
            "gemini" | "google" => Ok(ApiFamily::Gemini),
            other => Err(SignatureParseError(other.to_string())),
        }
    }
}

impl fmt::Display for ApiFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Chat,
    Cli,
    Video,
    Images,
    Embeddings,
    Audio,
    Models,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Chat => "chat",
            EndpointKind::Cli => "cli",
            EndpointKind::Video => "video",
            EndpointKind::Images => "images",
            EndpointKind::Embeddings => "embeddings",
            EndpointKind::Audio => "audio",
            EndpointKind::Models => "models",
        }
    }
}

impl FromStr for EndpointKind {
    type Err = SignatureParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(EndpointKind::Chat),
            "cli" => Ok(EndpointKind::Cli),
            "video" => Ok(EndpointKind::Video),
            "images" => Ok(EndpointKind::Images),
            "embeddings" => Ok(EndpointKind::Embeddings),
            "audio" => Ok(EndpointKind::Audio),
            "models" => Ok(EndpointKind::Models),
            other => Err(SignatureParseError(other.to_string())),
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ordered pair identifying one wire format, written `family:kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointSignature {
    pub family: ApiFamily,
    pub kind: EndpointKind,
}

impl EndpointSignature {
    pub const fn new(family: ApiFamily, kind: EndpointKind) -> Self {
        Self { family, kind }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.family, self.kind)
    }

    /// Billing task type for this signature. CLI is billing-equivalent to
    /// chat only at the collector-selection layer, so it keeps its own tag.
    pub fn task_type(&self) -> TaskType {
        match self.kind {
            EndpointKind::Chat => TaskType::Chat,
            EndpointKind::Cli => TaskType::Cli,
            EndpointKind::Video => TaskType::Video,
            EndpointKind::Images => TaskType::Images,
            EndpointKind::Embeddings => TaskType::Embeddings,
            EndpointKind::Audio => TaskType::Audio,
            EndpointKind::Models => TaskType::Chat,
        }
    }
}

impl FromStr for EndpointSignature {
    type Err = SignatureParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (family, kind) = value
            .split_once(':')
            .ok_or_else(|| SignatureParseError(value.to_string()))?;
        Ok(Self {
            family: family.parse()?,
            kind: kind.parse()?,
        })
    }
}

impl fmt::Display for EndpointSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Chat,
    Cli,
    Video,
    Images,
    Embeddings,
    Audio,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Chat => "chat",
            TaskType::Cli => "cli",
            TaskType::Video => "video",
            TaskType::Images => "images",
            TaskType::Embeddings => "embeddings",
            TaskType::Audio => "audio",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips_through_key() {
        let sig = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Chat);
        assert_eq!(sig.key(), "openai:chat");
        assert_eq!("openai:chat".parse::<EndpointSignature>().unwrap(), sig);
    }

    #[test]
    fn family_aliases_parse() {
        assert_eq!("anthropic".parse::<ApiFamily>().unwrap(), ApiFamily::Claude);
        assert_eq!("google".parse::<ApiFamily>().unwrap(), ApiFamily::Gemini);
    }

    #[test]
    fn unknown_kind_is_rejected(){
        assert!("openai:banana".parse::<EndpointSignature>().is_err());
    }
}
