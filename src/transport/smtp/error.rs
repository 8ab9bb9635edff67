//! Errors of one delivery cycle.
//!
//! These are absorbed by the retry loop in [`super::Mailer`]; only the
//! final outcome surfaces to callers, through [`super::SendResult`].

use std::io;

use super::response::Response;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
    #[error("could not parse server response: {0:?}")]
    ResponseParse(String),
    #[error("transient error: {0}")]
    Transient(Response),
    #[error("permanent error: {0}")]
    Permanent(Response),
    #[error("server does not support STARTTLS")]
    StartTlsNotSupported,
    #[error("server supports none of our authentication mechanisms")]
    NoCommonAuthMechanism,
    #[error("some recipients were refused: {0}")]
    RecipientsRefused(String),
    #[error("client error: {0}")]
    Client(&'static str),
}

impl Error {
    /// Classifies a negative reply by its severity.
    pub fn from_response(response: Response) -> Error {
        use super::response::Severity;
        match response.code.severity {
            Severity::TransientNegativeCompletion => Error::Transient(response),
            _ => Error::Permanent(response),
        }
    }
}
