//! Error types shared across the daemon

/// Failure reading or parsing an OS source during a sampling tick.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse value from {path}: {detail}")]
    Parse { path: String, detail: String },
}

/// A query rejected at the tool boundary. Core state is untouched.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid parameter `{name}`: {detail}")]
    InvalidParameter { name: &'static str, detail: String },

    #[error("malformed arguments for {tool}: {source}")]
    MalformedArguments {
        tool: String,
        source: serde_json::Error,
    },

    #[error("system query failed: {0}")]
    Collect(#[from] CollectError),

    #[error("{0} is not available")]
    Unavailable(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to write config {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
