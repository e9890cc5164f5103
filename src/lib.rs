mod error;

pub mod embedding;
pub mod gateway;
pub mod providers;
pub mod utils;

pub use error::{NexusError, Result};

pub use embedding::{Embedder, OpenAiEmbeddings};
pub use gateway::{
    CacheTier, ChatRequest, ChatResponse, Gateway, GatewayConfig, GatewayError, GatewayHttpState,
};
pub use providers::{AnthropicChat, ChatProvider, OpenAiChat, ProviderAdapter};
