use thiserror::Error;

/// Configuration problems detected before any training starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No constructor is registered under the declared class name.
    #[error("unknown {role} component class `{class}`")]
    UnknownComponent {
        /// The role the node was resolved for (embedder, encoder, ...).
        role: &'static str,
        /// The class name found in the configuration.
        class: String,
    },

    /// A required parameter is absent.
    #[error("missing required parameter `{field}`")]
    MissingParameter {
        /// Dotted path of the missing field.
        field: String,
    },

    /// A parameter is present but outside its allowed range or set.
    #[error("invalid value for `{field}`: {reason}")]
    InvalidParameter { field: String, reason: String },

    /// A parameter has the wrong JSON/TOML type.
    #[error("type mismatch for `{field}`: {reason}")]
    TypeMismatch { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingParameter {
            field: field.into(),
        }
    }
}

/// Errors that can occur while assembling, training or running a tagger.
#[derive(Debug, Error)]
pub enum SeqTagError {
    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dimension incompatibility between components or inputs.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A loss or gradient became NaN or infinite.
    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    /// A checkpoint could not be written or read.
    #[error("checkpoint I/O error at {path}: {reason}")]
    CheckpointIo { path: String, reason: String },

    /// The input text or sentence is empty.
    #[error("input is empty or whitespace-only")]
    EmptyInput,

    /// Candle tensor framework error.
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Tokenizer pattern failed to compile.
    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

impl SeqTagError {
    pub fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub fn checkpoint(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        Self::CheckpointIo {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error is eligible for per-batch recovery.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NumericalInstability(_))
    }
}

/// Result type alias for seqtag operations.
pub type Result<T> = std::result::Result<T, SeqTagError>;
