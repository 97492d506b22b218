//! Wire types of the streaming-only upstream API.

use serde::{Deserialize, Serialize};

use super::openai::ChatMessage;

/// Request body sent upstream. `stream` is always `true`; the translator
/// never builds this type any other way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub temperature: f64,
    pub max_tokens: u64,
    pub top_p: f64,
    pub repetition_penalty: f64,
}

/// One `data:` payload of the upstream stream. Only the content-bearing
/// fields are modelled; everything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamStreamChunk {
    #[serde(default)]
    pub choices: Vec<UpstreamChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamChoice {
    #[serde(default)]
    pub delta: Option<UpstreamContent>,
    #[serde(default)]
    pub message: Option<UpstreamContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamContent {
    #[serde(default)]
    pub content: Option<String>,
}

impl UpstreamStreamChunk {
    /// Content of the first choice, preferring `delta.content` over
    /// `message.content`. Empty strings count as absent.
    #[must_use]
    pub fn into_content(self) -> Option<String> {
        let choice = self.choices.into_iter().next()?;
        let non_empty = |part: Option<UpstreamContent>| {
            part.and_then(|p| p.content).filter(|text| !text.is_empty())
        };
        non_empty(choice.delta).or_else(|| non_empty(choice.message))
    }
}
