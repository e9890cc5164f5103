//! Upstream chat providers.
//!
//! Every family exposes the same capability through [`ChatProvider`]: send a
//! single user prompt, get the first completion text back. Family-specific
//! request and response envelopes never leave this module.

pub mod anthropic;
pub mod openai;
pub mod transport;

use async_trait::async_trait;

use crate::Result;

pub use anthropic::AnthropicChat;
pub use openai::OpenAiChat;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn provider(&self) -> &str;
    fn model_id(&self) -> &str;

    async fn send(&self, prompt: &str) -> Result<String>;
}

/// The closed set of provider families the router can hand out.
#[derive(Clone, Debug)]
pub enum ProviderAdapter {
    OpenAi(OpenAiChat),
    Anthropic(AnthropicChat),
}

#[async_trait]
impl ChatProvider for ProviderAdapter {
    fn provider(&self) -> &str {
        match self {
            Self::OpenAi(inner) => inner.provider(),
            Self::Anthropic(inner) => inner.provider(),
        }
    }

    fn model_id(&self) -> &str {
        match self {
            Self::OpenAi(inner) => inner.model_id(),
            Self::Anthropic(inner) => inner.model_id(),
        }
    }

    async fn send(&self, prompt: &str) -> Result<String> {
        match self {
            Self::OpenAi(inner) => inner.send(prompt).await,
            Self::Anthropic(inner) => inner.send(prompt).await,
        }
    }
}
