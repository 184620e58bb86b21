use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Metrics setup failed: {0}")]
    Metrics(String),

    #[error("Tracing initialization failed: {0}")]
    Tracing(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
