// Outbound HTTP clients for third-party APIs

pub mod anthropic;
pub mod stripe;

pub use anthropic::{AnthropicClient, Completion, CompletionProvider, ProviderError};
pub use stripe::{SignatureError, StripeClient, StripeError};
