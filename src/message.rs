//! Email data and MIME message building.
//!
//! [`EmailData`] is the value object assembled from the command line or a
//! parsed template. [`build_message`] validates it and produces a
//! transport-ready [`Message`]: RFC 5322 headers plus either a plain text
//! body or a `multipart/mixed` body with base64-encoded attachments.
//!
//! Bcc recipients are envelope-only and never appear in the headers.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use uuid::Uuid;

/// Error building a message. Validation problems are collected as a list
/// so all of them are reported together.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid email data: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("failed to read attachment {path}: {source}")]
    Attachment {
        path: PathBuf,
        source: io::Error,
    },
}

/// Structured data for one outgoing email.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailData {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub from_addr: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<PathBuf>,
}

impl EmailData {
    /// All envelope recipients: to + cc + bcc, in that order.
    pub fn all_recipients(&self) -> Vec<String> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .cloned()
            .collect()
    }

    /// Whether the body is blank.
    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }

    /// Checks the data and returns every problem found, not just the first.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.to.is_empty() {
            errors.push("no recipients specified".to_string());
        }
        if self.from_addr.is_empty() {
            errors.push("no from address specified".to_string());
        }
        for attachment in &self.attachments {
            if !attachment.exists() {
                errors.push(format!("attachment not found: {}", attachment.display()));
            } else if !attachment.is_file() {
                errors.push(format!(
                    "attachment is not a file: {}",
                    attachment.display()
                ));
            }
        }
        errors
    }

    /// The From header value with optional display name.
    pub fn format_from(&self) -> String {
        match &self.from_name {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, self.from_addr),
            _ => self.from_addr.clone(),
        }
    }
}

/// A built, transport-ready message.
#[derive(Debug, Clone)]
pub struct Message {
    headers: Vec<(String, String)>,
    body: Body,
}

#[derive(Debug, Clone)]
enum Body {
    Plain(String),
    Mixed {
        text: String,
        attachments: Vec<Attachment>,
        boundary: String,
    },
}

#[derive(Debug, Clone)]
struct Attachment {
    filename: String,
    content_type: String,
    content: Vec<u8>,
}

impl Message {
    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serializes the full message, CRLF line endings throughout.
    pub fn formatted(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"MIME-Version: 1.0\r\n");
        match &self.body {
            Body::Plain(text) => {
                out.extend_from_slice(
                    b"Content-Type: text/plain; charset=utf-8\r\n\
                      Content-Transfer-Encoding: 8bit\r\n\r\n",
                );
                out.extend_from_slice(crlf(text).as_bytes());
            }
            Body::Mixed {
                text,
                attachments,
                boundary,
            } => {
                out.extend_from_slice(
                    format!(
                        "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
                        boundary
                    )
                    .as_bytes(),
                );
                out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
                out.extend_from_slice(
                    b"Content-Type: text/plain; charset=utf-8\r\n\
                      Content-Transfer-Encoding: 8bit\r\n\r\n",
                );
                out.extend_from_slice(crlf(text).as_bytes());
                out.extend_from_slice(b"\r\n");
                for attachment in attachments {
                    out.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
                    out.extend_from_slice(
                        format!(
                            "Content-Type: {}; name=\"{}\"\r\n\
                             Content-Disposition: attachment; filename=\"{}\"\r\n\
                             Content-Transfer-Encoding: base64\r\n\r\n",
                            attachment.content_type, attachment.filename, attachment.filename
                        )
                        .as_bytes(),
                    );
                    for chunk in attachment.content.chunks(57) {
                        out.extend_from_slice(base64::encode(chunk).as_bytes());
                        out.extend_from_slice(b"\r\n");
                    }
                }
                out.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
            }
        }
        out
    }
}

/// Builds a [`Message`] from validated [`EmailData`].
pub fn build_message(data: &EmailData) -> Result<Message, MessageError> {
    let errors = data.validate();
    if !errors.is_empty() {
        return Err(MessageError::Invalid(errors));
    }

    let mut headers = vec![
        ("From".to_string(), data.format_from()),
        ("To".to_string(), data.to.join(", ")),
    ];
    if !data.cc.is_empty() {
        headers.push(("Cc".to_string(), data.cc.join(", ")));
    }
    if let Some(reply_to) = &data.reply_to {
        headers.push(("Reply-To".to_string(), reply_to.clone()));
    }
    headers.push(("Subject".to_string(), data.subject.clone()));
    headers.push((
        "Date".to_string(),
        httpdate::fmt_http_date(SystemTime::now()),
    ));
    headers.push((
        "Message-ID".to_string(),
        format!(
            "<{}@{}>",
            Uuid::new_v4().simple(),
            extract_domain(&data.from_addr)
        ),
    ));

    let body = if data.attachments.is_empty() {
        Body::Plain(data.body.clone())
    } else {
        let attachments = data
            .attachments
            .iter()
            .map(|path| read_attachment(path))
            .collect::<Result<Vec<_>, _>>()?;
        Body::Mixed {
            text: data.body.clone(),
            attachments,
            boundary: Uuid::new_v4().simple().to_string(),
        }
    };

    Ok(Message { headers, body })
}

/// Human-readable summary used for confirmation prompts and dry runs.
/// Long bodies are truncated to their first ten lines.
pub fn format_summary(data: &EmailData) -> String {
    let mut lines = vec![format!("From: {}", data.format_from())];
    lines.push(format!("To: {}", data.to.join(", ")));
    if !data.cc.is_empty() {
        lines.push(format!("Cc: {}", data.cc.join(", ")));
    }
    if !data.bcc.is_empty() {
        lines.push(format!("Bcc: {}", data.bcc.join(", ")));
    }
    if let Some(reply_to) = &data.reply_to {
        lines.push(format!("Reply-To: {}", reply_to));
    }
    lines.push(format!("Subject: {}", data.subject));
    if !data.attachments.is_empty() {
        let names: Vec<String> = data
            .attachments
            .iter()
            .map(|p| file_name(p).to_string())
            .collect();
        lines.push(format!("Attachments: {}", names.join(", ")));
    }
    lines.push(String::new());
    lines.push("--- Body ---".to_string());

    let body_lines: Vec<&str> = data.body.trim().split('\n').collect();
    if body_lines.len() > 10 {
        lines.extend(body_lines[..10].iter().map(|l| l.to_string()));
        lines.push(format!("... ({} more lines)", body_lines.len() - 10));
    } else {
        lines.extend(body_lines.iter().map(|l| l.to_string()));
    }

    lines.join("\n")
}

fn read_attachment(path: &Path) -> Result<Attachment, MessageError> {
    let content = std::fs::read(path).map_err(|source| MessageError::Attachment {
        path: path.to_path_buf(),
        source,
    })?;
    let content_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    Ok(Attachment {
        filename: file_name(path).to_string(),
        content_type,
        content,
    })
}

fn file_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment")
}

fn extract_domain(email: &str) -> &str {
    match email.split_once('@') {
        Some((_, domain)) if !domain.is_empty() => domain,
        _ => "localhost",
    }
}

fn crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    for line in text.split('\n') {
        out.push_str(line.trim_end_matches('\r'));
        out.push_str("\r\n");
    }
    out
}
