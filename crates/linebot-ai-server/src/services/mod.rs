pub mod orchestrator;
pub mod providers;
pub mod routing;

pub use orchestrator::{ExchangeError, ExchangeSettings, Orchestrator};
pub use providers::{LlmProvider, ProviderError, ProviderRegistry, ProviderReply};
