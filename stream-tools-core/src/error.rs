use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Bad constructor arguments or settings. Fatal, never retried.
    #[error("Config Error - {0}")]
    Config(String),

    /// A field value could not be coerced to the number an aggregation needs.
    #[error("Parse Error - {0}")]
    Parse(String),

    /// The log could not be polled. Retried with the cursors unchanged.
    #[error("Upstream Unavailable - {0}")]
    Upstream(String),

    #[error("Key Absent - {0}")]
    KeyAbsent(String),

    /// The log rejected an append.
    #[error("Source Error - {0}")]
    Source(String),

    /// The delivery channel or the reader task went away.
    #[error("Closed - {0}")]
    Closed(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl Error {
    /// Only an unavailable upstream is worth polling again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Upstream(_))
    }
}
