//! Delivery over SMTP.
//!
//! [`Mailer`] drives the whole delivery: for each attempt it walks the
//! configured ports in order, opening a fresh connection per port, and
//! between failed attempts it backs off exponentially. A delivery either
//! fully succeeds on one connection or the cycle is abandoned and retried.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{ConfigError, SmtpServer};
use crate::message::Message;

pub mod authentication;
mod connection;
pub mod error;
pub mod response;

pub use self::authentication::Credentials;
pub use self::connection::SmtpConnection;
pub use self::error::Error;

/// Default submission over TLS port
pub const SUBMISSIONS_PORT: u16 = 465;

/// Outcome of a full delivery run, after all retries.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub success: bool,
    /// Human-readable summary, printed by the CLI.
    pub message: String,
    /// Connection attempts made, counting every outer retry once.
    pub attempts: u32,
    /// Acknowledgment line from the server on success.
    pub smtp_response: Option<String>,
}

/// Errors that abort a delivery run before any connection is tried.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("message has no sender address")]
    MissingSender,
}

/// Blocking SMTP mailer with retry and backoff.
#[derive(Debug, Clone)]
pub struct Mailer {
    hello_name: String,
    backoff_unit: Duration,
}

impl Default for Mailer {
    fn default() -> Mailer {
        Mailer::new()
    }
}

impl Mailer {
    pub fn new() -> Mailer {
        let hello_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Mailer {
            hello_name,
            backoff_unit: Duration::from_secs(1),
        }
    }

    /// Overrides the base wait between attempts. Attempt `n` waits
    /// `backoff_unit * 2^n` before retrying.
    pub fn backoff_unit(mut self, unit: Duration) -> Mailer {
        self.backoff_unit = unit;
        self
    }

    /// Delivers `message` to `recipients` through `server`, retrying the
    /// whole port walk up to `retries` extra times.
    pub fn send(
        &self,
        message: &Message,
        recipients: &[String],
        server: &SmtpServer,
        retries: u32,
    ) -> Result<SendResult, SendError> {
        let from = envelope_sender(message).ok_or(SendError::MissingSender)?;
        let password = server.resolve_password()?;
        let credentials = match (&server.user, password) {
            (Some(user), Some(password)) => Some(Credentials::new(user.clone(), password)),
            _ => None,
        };
        let formatted = message.formatted();

        let mut attempts = 0;
        let mut last_error: Option<Error> = None;

        for attempt in 0..=retries {
            attempts = attempt + 1;
            for &port in &server.ports {
                debug!(
                    "delivery attempt {} via {}:{}",
                    attempts, server.host, port
                );
                match self.deliver_once(
                    server,
                    port,
                    credentials.as_ref(),
                    &from,
                    recipients,
                    &formatted,
                ) {
                    Ok(response) => {
                        info!("delivered via {}:{}", server.host, port);
                        return Ok(SendResult {
                            success: true,
                            message: format!("email sent via {}:{}", server.host, port),
                            attempts,
                            smtp_response: Some(response),
                        });
                    }
                    Err(e) => {
                        warn!("delivery via {}:{} failed: {}", server.host, port, e);
                        last_error = Some(e);
                    }
                }
            }
            if attempt < retries {
                let wait = self.backoff_unit * 2u32.saturating_pow(attempt);
                debug!("waiting {:?} before retrying", wait);
                std::thread::sleep(wait);
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no ports configured".to_string());
        Ok(SendResult {
            success: false,
            message: format!(
                "failed to send email after {} attempt(s): {}",
                attempts, detail
            ),
            attempts,
            smtp_response: None,
        })
    }

    /// One full SMTP session on one port. Port 465 uses implicit TLS;
    /// other ports start plain and upgrade with STARTTLS when the server
    /// requires it. QUIT is attempted whether the session succeeded or
    /// not, with its errors swallowed.
    fn deliver_once(
        &self,
        server: &SmtpServer,
        port: u16,
        credentials: Option<&Credentials>,
        from: &str,
        recipients: &[String],
        formatted: &[u8],
    ) -> Result<String, Error> {
        let mut conn = self.open(server, port)?;
        let outcome = Self::run_session(&mut conn, credentials, from, recipients, formatted);
        let _ = conn.quit();
        outcome
    }

    fn run_session(
        conn: &mut SmtpConnection,
        credentials: Option<&Credentials>,
        from: &str,
        recipients: &[String],
        formatted: &[u8],
    ) -> Result<String, Error> {
        if let Some(credentials) = credentials {
            conn.auth(credentials)?;
        }
        conn.send(from, recipients, formatted)?;
        Ok(conn.noop()?.to_string())
    }

    fn open(&self, server: &SmtpServer, port: u16) -> Result<SmtpConnection, Error> {
        if port == SUBMISSIONS_PORT {
            let mut conn = SmtpConnection::connect_tls(&server.host, port)?;
            conn.ehlo(&self.hello_name)?;
            return Ok(conn);
        }
        let mut conn = SmtpConnection::connect(&server.host, port)?;
        conn.ehlo(&self.hello_name)?;
        if server.use_tls {
            conn = conn.starttls(&server.host)?;
            conn.ehlo(&self.hello_name)?;
        }
        Ok(conn)
    }

    /// Probes each configured port with a full handshake but no message,
    /// stopping at the first port that works.
    pub fn test_connection(&self, server: &SmtpServer) -> Result<SendResult, SendError> {
        let password = server.resolve_password()?;
        let credentials = match (&server.user, password) {
            (Some(user), Some(password)) => Some(Credentials::new(user.clone(), password)),
            _ => None,
        };

        let mut last_error: Option<Error> = None;
        for &port in &server.ports {
            let outcome = self.open(server, port).and_then(|mut conn| {
                let authed = match &credentials {
                    Some(credentials) => conn.auth(credentials),
                    None => Ok(()),
                };
                let _ = conn.quit();
                authed
            });
            match outcome {
                Ok(()) => {
                    return Ok(SendResult {
                        success: true,
                        message: format!("connection to {}:{} succeeded", server.host, port),
                        attempts: 1,
                        smtp_response: None,
                    });
                }
                Err(e) => {
                    warn!("connection test on {}:{} failed: {}", server.host, port, e);
                    last_error = Some(e);
                }
            }
        }
        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no ports configured".to_string());
        Ok(SendResult {
            success: false,
            message: format!("could not connect to {}: {}", server.host, detail),
            attempts: 1,
            smtp_response: None,
        })
    }
}

/// Bare address used on the SMTP envelope, taken from the From header.
fn envelope_sender(message: &Message) -> Option<String> {
    let from = message.header("From")?;
    let address = match (from.rfind('<'), from.rfind('>')) {
        (Some(start), Some(end)) if start < end => &from[start + 1..end],
        _ => from,
    };
    let address = address.trim();
    if address.is_empty() {
        None
    } else {
        Some(address.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{build_message, EmailData};

    fn sample_message(from_name: Option<&str>) -> Message {
        let data = EmailData {
            to: vec!["rcpt@example.com".to_string()],
            from_addr: "sender@example.com".to_string(),
            from_name: from_name.map(String::from),
            subject: "hi".to_string(),
            body: "hello".to_string(),
            ..EmailData::default()
        };
        build_message(&data).unwrap()
    }

    #[test]
    fn envelope_sender_uses_bare_address() {
        let message = sample_message(None);
        assert_eq!(
            envelope_sender(&message).as_deref(),
            Some("sender@example.com")
        );
    }

    #[test]
    fn envelope_sender_strips_display_name() {
        let message = sample_message(Some("A Sender"));
        assert_eq!(
            envelope_sender(&message).as_deref(),
            Some("sender@example.com")
        );
    }
}
