use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed building transport: {0}")]
    Transport(#[from] crate::transmission::TransportError),
}

impl ChannelError {
    pub(crate) fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        ChannelError::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}
