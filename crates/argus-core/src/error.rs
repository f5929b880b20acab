use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArgusError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service {0:?} already exists")]
    ServiceExists(String),

    #[error("service name {name:?} is already used by {existing:?}")]
    DuplicateName { name: String, existing: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("config file not found: {0}")]
    ConfigNotFound(String),

    #[error("invalid duration {0:?} (use 'AhBmCs' duration format)")]
    InvalidDuration(String),

    #[error("query failed for {service}: {reason}")]
    Query { service: String, reason: String },

    #[error("failed converting {0:?} to a semantic version")]
    NotSemantic(String),

    #[error("queried version {queried:?} is less than the latest version {latest:?}")]
    VersionRegression { queried: String, latest: String },

    #[error("{kind} didn't return any matches ({pattern})")]
    NoMatch { kind: String, pattern: String },

    #[error("{0}")]
    Action(String),

    #[error("unknown status column {0:?}")]
    UnknownColumn(String),

    #[error("shutdown did not finish within {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ArgusError>;
