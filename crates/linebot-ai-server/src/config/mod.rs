pub mod settings;

pub use settings::{
    CacheConfig, DatabaseConfig, HistoryConfig, ImageConfig, LimitsConfig, LoggingConfig,
    ProviderConfig, ProvidersConfig, RedisConfig, ResultScope, ServerConfig, Settings,
};
