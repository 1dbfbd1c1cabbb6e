use std::path::PathBuf;

use thiserror::Error;

pub type FlowResult<T, E = FlowError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("secret `{0}` is not set")]
    MissingSecret(String),

    #[error("secret `{name}` is malformed: {message}")]
    InvalidSecret { name: String, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned {status}: {message}")]
    Api {
        service: &'static str,
        status: u16,
        message: String,
    },

    #[error("failed to authenticate against GCP: {0}")]
    Auth(String),

    #[error("gave up after {attempts} attempts: API quota still exhausted")]
    QuotaExhausted { attempts: u32 },

    #[error("invalid resource name `{0}`")]
    InvalidResourceName(String),

    #[error("unexpected payload from {source_name}: {message}")]
    Payload {
        source_name: &'static str,
        message: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("state store error: {0}")]
    State(#[from] rusqlite::Error),

    #[error("state store lock poisoned")]
    StatePoisoned,

    #[error("I/O error while accessing {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown flow `{0}`")]
    UnknownFlow(String),
}

impl FlowError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn payload(source_name: &'static str, message: impl Into<String>) -> Self {
        Self::Payload {
            source_name,
            message: message.into(),
        }
    }

    pub fn invalid_secret(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSecret {
            name: name.into(),
            message: message.into(),
        }
    }
}
