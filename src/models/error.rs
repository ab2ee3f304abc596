use std::fmt;

#[derive(Debug)]
pub struct TickwatchError {
    pub kind: TickwatchErrorKind,
    pub backtrace: std::backtrace::Backtrace,
}

#[derive(Debug)]
pub enum TickwatchErrorKind {
    // Feed token missing or rejected by the upstream authorizer.
    UpstreamAuth(String),
    // Socket-level failure on the upstream feed connection.
    UpstreamTransport(String),
    // Reconnect backoff ceiling reached; operator intervention required.
    UpstreamExhausted(u32),
    CacheStore(redis::RedisError),
    DurableStore(mongodb::error::Error),
    NotificationPermanent(String),
    NotificationTransient(String),
    HttpError(reqwest::Error),
    SerializationError(serde_json::Error),
    DecodeError(prost::DecodeError),
    ConfigError(String),
    Other(String),
}

impl fmt::Display for TickwatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TickwatchErrorKind::UpstreamAuth(msg) => write!(f, "Upstream Auth Error: {}", msg),
            TickwatchErrorKind::UpstreamTransport(msg) => {
                write!(f, "Upstream Transport Error: {}", msg)
            }
            TickwatchErrorKind::UpstreamExhausted(attempts) => {
                write!(f, "Upstream reconnect exhausted after {} attempts", attempts)
            }
            TickwatchErrorKind::CacheStore(e) => write!(f, "Cache Store Error: {}", e),
            TickwatchErrorKind::DurableStore(e) => write!(f, "Durable Store Error: {}", e),
            TickwatchErrorKind::NotificationPermanent(msg) => {
                write!(f, "Notification Permanent Failure: {}", msg)
            }
            TickwatchErrorKind::NotificationTransient(msg) => {
                write!(f, "Notification Transient Failure: {}", msg)
            }
            TickwatchErrorKind::HttpError(e) => write!(f, "HTTP Error: {}", e),
            TickwatchErrorKind::SerializationError(e) => write!(f, "Serialization Error: {}", e),
            TickwatchErrorKind::DecodeError(e) => write!(f, "Frame Decode Error: {}", e),
            TickwatchErrorKind::ConfigError(msg) => write!(f, "Config Error: {}", msg),
            TickwatchErrorKind::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for TickwatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TickwatchErrorKind::CacheStore(e) => Some(e),
            TickwatchErrorKind::DurableStore(e) => Some(e),
            TickwatchErrorKind::HttpError(e) => Some(e),
            TickwatchErrorKind::SerializationError(e) => Some(e),
            TickwatchErrorKind::DecodeError(e) => Some(e),
            _ => None,
        }
    }
}

impl TickwatchError {
    /// Create a new error with the given kind
    pub fn new(kind: TickwatchErrorKind) -> Self {
        TickwatchError {
            kind,
            backtrace: std::backtrace::Backtrace::capture(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::new(TickwatchErrorKind::Other(msg.into()))
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(TickwatchErrorKind::UpstreamAuth(msg.into()))
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(TickwatchErrorKind::UpstreamTransport(msg.into()))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(TickwatchErrorKind::ConfigError(msg.into()))
    }

    /// Get the backtrace for this error
    pub fn backtrace(&self) -> &std::backtrace::Backtrace {
        &self.backtrace
    }
}

impl From<reqwest::Error> for TickwatchError {
    fn from(error: reqwest::Error) -> Self {
        Self::new(TickwatchErrorKind::HttpError(error))
    }
}

impl From<serde_json::Error> for TickwatchError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(TickwatchErrorKind::SerializationError(error))
    }
}

impl From<redis::RedisError> for TickwatchError {
    fn from(error: redis::RedisError) -> Self {
        Self::new(TickwatchErrorKind::CacheStore(error))
    }
}

impl From<mongodb::error::Error> for TickwatchError {
    fn from(error: mongodb::error::Error) -> Self {
        Self::new(TickwatchErrorKind::DurableStore(error))
    }
}

impl From<prost::DecodeError> for TickwatchError {
    fn from(error: prost::DecodeError) -> Self {
        Self::new(TickwatchErrorKind::DecodeError(error))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TickwatchError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::new(TickwatchErrorKind::UpstreamTransport(error.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, TickwatchError>;
