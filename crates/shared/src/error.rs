/// Error type shared by the crypto core and the applications embedding it.
#[derive(Debug, thiserror::Error)]
pub enum VeilboxError {
    #[error("not found")]
    NotFound,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}
