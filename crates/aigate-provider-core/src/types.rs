use serde::{Deserialize, Serialize};

/// Closed set of upstream kinds. The tag selects both the wire protocol and
/// the family of models a pool may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderType {
    #[serde(rename = "gemini-cli-oauth")]
    GeminiCliOAuth,
    #[serde(rename = "gemini-antigravity")]
    GeminiAntigravity,
    #[serde(rename = "openai-custom")]
    OpenAICustom,
    #[serde(rename = "openai-responses")]
    OpenAIResponses,
    #[serde(rename = "claude-custom")]
    ClaudeCustom,
    #[serde(rename = "claude-kiro-oauth")]
    ClaudeKiroOAuth,
    #[serde(rename = "openai-qwen-oauth")]
    QwenOAuth,
}

impl ProviderType {
    pub const ALL: [ProviderType; 7] = [
        ProviderType::GeminiCliOAuth,
        ProviderType::GeminiAntigravity,
        ProviderType::OpenAICustom,
        ProviderType::OpenAIResponses,
        ProviderType::ClaudeCustom,
        ProviderType::ClaudeKiroOAuth,
        ProviderType::QwenOAuth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::GeminiCliOAuth => "gemini-cli-oauth",
            ProviderType::GeminiAntigravity => "gemini-antigravity",
            ProviderType::OpenAICustom => "openai-custom",
            ProviderType::OpenAIResponses => "openai-responses",
            ProviderType::ClaudeCustom => "claude-custom",
            ProviderType::ClaudeKiroOAuth => "claude-kiro-oauth",
            ProviderType::QwenOAuth => "openai-qwen-oauth",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        ProviderType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == tag)
    }

    /// Protocol family, derived from the type tag. Same-protocol fallback
    /// candidates must share this prefix.
    pub fn protocol_prefix(&self) -> &'static str {
        let tag = self.as_str();
        match tag.split_once('-') {
            Some((prefix, _)) => match prefix {
                "gemini" => "gemini",
                "openai" => "openai",
                "claude" => "claude",
                _ => tag,
            },
            None => tag,
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for provider_type in ProviderType::ALL {
            assert_eq!(
                ProviderType::parse(provider_type.as_str()),
                Some(provider_type)
            );
        }
        assert_eq!(ProviderType::parse("claude-kiro"), None);
    }

    #[test]
    fn protocol_prefix_groups_same_wire_protocol() {
        assert_eq!(ProviderType::ClaudeKiroOAuth.protocol_prefix(), "claude");
        assert_eq!(ProviderType::ClaudeCustom.protocol_prefix(), "claude");
        assert_eq!(ProviderType::OpenAIResponses.protocol_prefix(), "openai");
        assert_eq!(ProviderType::QwenOAuth.protocol_prefix(), "openai");
        assert_ne!(
            ProviderType::GeminiCliOAuth.protocol_prefix(),
            ProviderType::ClaudeCustom.protocol_prefix()
        );
    }
}
