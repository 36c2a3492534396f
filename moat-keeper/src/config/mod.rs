//! Configuration layers.
//!
//! Every moat runs on a *fond* config: the immutable baseline registered at
//! bootstrap merged with the latest [`ExternalConfig`] override, override
//! fields winning field by field. The merge is a pure function of the two
//! inputs, so a changed override is detected by comparing fond configs.

mod baseline;
mod external;
mod limit;
mod property;
mod source;

pub use baseline::BaselineConfigs;
pub use baseline::FallbackConfig;
pub use baseline::ResourceConfig;
pub use external::ExternalConfig;
pub use limit::ConcurrentLimitConfig;
pub use limit::RateLimitConfig;
pub use source::CapListener;
pub use source::ConfigSource;
pub use source::InMemoryConfigSource;

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown property `{0}`")]
    UnknownProperty(String),

    #[error("invalid value `{value}` for `{property}`: {message}")]
    InvalidValue {
        property: &'static str,
        value: String,
        message: String,
    },

    #[error("invalid configuration for {resource}: {source}")]
    Invalid {
        resource: String,
        #[source]
        source: moat_limit::ConfigError,
    },
}
