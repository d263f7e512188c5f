use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Logging init failed: {0}")]
    Logging(String),
}
