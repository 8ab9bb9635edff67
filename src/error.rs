//! Top-level error type for the binary.

use crate::compose::ComposeError;
use crate::config::ConfigError;
use crate::message::MessageError;
use crate::transport::smtp::SendError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
