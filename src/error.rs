use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("failed to connect to Telegram: {0}")]
    Connection(String),
    #[error("not authorized — run 'periscope login' first")]
    NotAuthorized,
}
