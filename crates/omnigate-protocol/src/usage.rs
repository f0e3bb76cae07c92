//! Normalized token accounting extracted from upstream terminal metadata.

use serde::{Deserialize, Serialize};

use crate::{claude, gemini, openai};

/// Family-neutral token counts for one exchange.
///
/// Cache-creation tokens carry an optional 5m/1h TTL split when the upstream
/// reports one; the undivided total is always populated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_creation_tokens_5m: i64,
    pub cache_creation_tokens_1h: i64,
    pub cache_read_tokens: i64,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn merge_max(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.cache_creation_tokens = self.cache_creation_tokens.max(other.cache_creation_tokens);
        self.cache_creation_tokens_5m = self
            .cache_creation_tokens_5m
            .max(other.cache_creation_tokens_5m);
        self.cache_creation_tokens_1h = self
            .cache_creation_tokens_1h
            .max(other.cache_creation_tokens_1h);
        self.cache_read_tokens = self.cache_read_tokens.max(other.cache_read_tokens);
    }
}

impl From<&openai::CompletionUsage> for TokenUsage {
    fn from(usage: &openai::CompletionUsage) -> Self {
        let cache_read = usage
            .prompt_tokens_details
            .map(|details| details.cached_tokens)
            .unwrap_or(0);
        Self {
            // openai reports cached tokens inside prompt_tokens.
            input_tokens: (usage.prompt_tokens - cache_read).max(0),
            output_tokens: usage.completion_tokens,
            cache_read_tokens: cache_read,
            ..Default::default()
        }
    }
}

impl From<&openai::ResponsesUsage> for TokenUsage {
    fn from(usage: &openai::ResponsesUsage) -> Self {
        let cache_read = usage
            .input_tokens_details
            .map(|details| details.cached_tokens)
            .unwrap_or(0);
        Self {
            // The Responses API also folds cached tokens into input_tokens.
            input_tokens: (usage.input_tokens - cache_read).max(0),
            output_tokens: usage.output_tokens,
            cache_read_tokens: cache_read,
            ..Default::default()
        }
    }
}

impl From<&claude::Usage> for TokenUsage {
    fn from(usage: &claude::Usage) -> Self {
        let (split_5m, split_1h) = usage
            .cache_creation
            .map(|split| {
                (
                    split.ephemeral_5m_input_tokens,
                    split.ephemeral_1h_input_tokens,
                )
            })
            .unwrap_or((0, 0));
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_creation_tokens: usage.cache_creation_input_tokens,
            cache_creation_tokens_5m: split_5m,
            cache_creation_tokens_1h: split_1h,
            cache_read_tokens: usage.cache_read_input_tokens,
        }
    }
}

impl From<&gemini::UsageMetadata> for TokenUsage {
    fn from(usage: &gemini::UsageMetadata) -> Self {
        Self {
            input_tokens: (usage.prompt_token_count - usage.cached_content_token_count).max(0),
            output_tokens: usage.candidates_token_count + usage.thoughts_token_count,
            cache_read_tokens: usage.cached_content_token_count,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_cached_tokens_are_subtracted_from_input() {
        let usage = openai::CompletionUsage {
            prompt_tokens: 100,
            completion_tokens: 10,
            total_tokens: 110,
            prompt_tokens_details: Some(openai::PromptTokensDetails { cached_tokens: 40 }),
        };
        let tokens = TokenUsage::from(&usage);
        assert_eq!(tokens.input_tokens, 60);
        assert_eq!(tokens.cache_read_tokens, 40);
    }

    #[test]
    fn responses_usage_maps_like_chat_usage() {
        let usage = openai::ResponsesUsage {
            input_tokens: 100,
            output_tokens: 10,
            total_tokens: 110,
            input_tokens_details: Some(openai::ResponsesInputTokensDetails { cached_tokens: 40 }),
        };
        let tokens = TokenUsage::from(&usage);
        assert_eq!(tokens.input_tokens, 60);
        assert_eq!(tokens.cache_read_tokens, 40);
    }

    #[test]
    fn merge_max_keeps_largest_counts() {
        let mut seen = TokenUsage {
            input_tokens: 5,
            output_tokens: 0,
            ..Default::default()
        };
        seen.merge_max(&TokenUsage {
            input_tokens: 5,
            output_tokens: 12,
            ..Default::default()
        });
        assert_eq!(seen.output_tokens, 12);
    }

    #[test]
    fn gemini_thought_tokens_count_as_output() {
        let usage = gemini::UsageMetadata {
            prompt_token_count: 10,
            candidates_token_count: 4,
            thoughts_token_count: 6,
            ..Default::default()
        };
        let tokens = TokenUsage::from(&usage);
        assert_eq!(tokens.output_tokens, 10);
    }
}
