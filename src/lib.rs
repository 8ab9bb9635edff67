//! tmail composes and sends email from the terminal. It provides:
//!
//! * A flat-text template opened in `$VISUAL`/`$EDITOR` for composing
//! * TOML configuration of SMTP servers, identities and defaults
//! * A blocking SMTP client with STARTTLS, implicit TLS and AUTH
//! * Retry with exponential backoff across the configured ports
//!
//! The pieces are usable as a library: [`Config`] loads configuration,
//! [`EditSession`] runs the compose loop, [`build_message`] turns the
//! composed data into an RFC 5322 message, and [`Mailer`] delivers it.

pub mod compose;
pub mod config;
pub mod error;
pub mod message;
pub mod template;
pub mod transport;

pub use self::compose::{ComposeError, EditSession};
pub use self::config::{Config, ConfigError, Identity, SmtpServer};
pub use self::error::Error;
pub use self::message::{build_message, EmailData, Message, MessageError};
pub use self::template::{ComposedEmail, TemplateError, TEMPLATE_SEPARATOR};
pub use self::transport::smtp::{Mailer, SendError, SendResult};
