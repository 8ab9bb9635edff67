//! The editable email template.
//!
//! An email is round-tripped through a flat-text document so it can be
//! edited in any external editor. The document has a fixed shape: comment
//! instructions, a header block, the literal `---` separator on its own
//! line, then the body.
//!
//! Identities and reply-to addresses are offered as a menu of `From:` and
//! `Reply-To:` lines where exactly one of each is uncommented; the user
//! picks one by moving the `#` marker. Each menu line carries a trailing
//! `  # [label]` annotation which is stripped, never interpreted, when the
//! document is parsed back.
//!
//! Parsing is deliberately permissive: the only structural requirement of
//! an edited document is the separator line. Duplicate uncommented headers
//! are joined rather than rejected, and header validation happens
//! downstream.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{Config, Identity};

/// Literal line dividing headers from body.
pub const TEMPLATE_SEPARATOR: &str = "---";

const COMMENT_MARKER: char = '#';
/// A trailing annotation starts with two spaces and the comment marker.
const ANNOTATION_START: &str = "  #";

const HEADER_INSTRUCTIONS: &str = "\
# tmail - email composer
# Lines starting with '#' are comments and will be ignored.
# Edit the headers and body below, then save and exit.
#
# FROM IDENTITY: Uncomment ONE line to select your sending identity.
# DISPLAY NAME: Edit the name portion to customize (e.g., \"Custom Name <email>\").
# REPLY-TO: Uncomment ONE line to select the reply-to address.";

/// `Name <addr>` mailbox shape. Anything else is a bare address.
static MAILBOX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<name>[^<]*)<(?P<addr>[^>]*)>$").unwrap());

/// Failure to parse an edited template. Recoverable by re-editing.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error(
        "template missing separator line ('---'); \
         keep the separator between headers and body"
    )]
    MissingSeparator,
}

/// Result of an editing session.
///
/// `cancelled` is set when the user left the document untouched; all other
/// fields are empty in that case and the caller must treat it as "do
/// nothing".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposedEmail {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub from_addr: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub body: String,
    pub cancelled: bool,
}

impl ComposedEmail {
    /// The value returned for an unmodified editing session.
    pub fn cancelled() -> ComposedEmail {
        ComposedEmail {
            cancelled: true,
            ..ComposedEmail::default()
        }
    }
}

/// Pre-filled fields for template generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefill<'a> {
    pub to: &'a [String],
    pub cc: &'a [String],
    pub bcc: &'a [String],
    /// Pre-selected identity by friendly name.
    pub identity: Option<&'a str>,
    pub reply_to: Option<&'a str>,
    pub subject: Option<&'a str>,
    pub body: Option<&'a str>,
    /// Display name override for the selected identity.
    pub display_name: Option<&'a str>,
}

/// Generates the editable template for the configured identities.
pub fn generate(config: &Config, prefill: &Prefill) -> String {
    let mut lines = vec![HEADER_INSTRUCTIONS.to_string(), String::new()];

    let selected: Option<&Identity> = prefill
        .identity
        .and_then(|name| config.identity(name))
        .or_else(|| config.default_identity());

    lines.push("# ┌─── FROM IDENTITY (select one) ───┐".into());
    for identity in &config.identities {
        let is_selected = selected.map_or(false, |s| s.name == identity.name);
        let prefix = if is_selected { "" } else { "#" };
        let display_name = if is_selected {
            prefill.display_name
        } else {
            None
        };
        lines.push(format!(
            "{}From: {}  # [{}]",
            prefix,
            identity.format_from(display_name),
            identity.name
        ));
    }
    lines.push("# └────────────────────────────────────┘".into());
    lines.push(String::new());

    if let Some(identity) = selected {
        lines.push(format!(
            "# ┌─── REPLY-TO for [{}] (select one) ───┐",
            identity.name
        ));
        let effective = prefill
            .reply_to
            .filter(|requested| identity.reply_to.iter().any(|rt| rt == requested))
            .unwrap_or(&identity.reply_to[0]);
        for rt in &identity.reply_to {
            let prefix = if rt == effective { "" } else { "#" };
            lines.push(format!("{}Reply-To: {}  # [{}]", prefix, rt, identity.name));
        }
        lines.push("# └──────────────────────────────────────────────┘".into());
        lines.push(String::new());
    }

    lines.push(format!("To: {}", prefill.to.join(", ")));
    lines.push(format!("Cc: {}", prefill.cc.join(", ")));
    lines.push(format!("Bcc: {}", prefill.bcc.join(", ")));
    lines.push(format!("Subject: {}", prefill.subject.unwrap_or("")));
    lines.push(String::new());
    lines.push(TEMPLATE_SEPARATOR.into());
    lines.push(String::new());
    lines.push(prefill.body.unwrap_or("").into());

    lines.join("\n")
}

/// Parses an edited template back into structured email data.
///
/// Fails only when the separator line is missing; every header is optional
/// here and validated downstream.
pub fn parse(content: &str) -> Result<ComposedEmail, TemplateError> {
    let lines: Vec<&str> = content.split('\n').collect();

    let separator_idx = lines
        .iter()
        .position(|line| line.trim() == TEMPLATE_SEPARATOR)
        .ok_or(TemplateError::MissingSeparator)?;

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in &lines[..separator_idx] {
        let line = line.trim();
        if line.is_empty() || line.starts_with(COMMENT_MARKER) {
            continue;
        }
        let (key, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let key = key.trim().to_lowercase();
        let value = strip_annotation(value.trim());

        // A second uncommented menu line left active appends, it never errors.
        match headers.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) if !existing.is_empty() && !value.is_empty() => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            Some((_, existing)) if existing.is_empty() => *existing = value,
            Some(_) => {}
            None => headers.push((key, value)),
        }
    }

    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    };

    let (from_name, from_addr) = parse_mailbox(header("from"));
    let reply_to_raw = strip_annotation(header("reply-to"));
    let reply_to = if reply_to_raw.is_empty() {
        None
    } else {
        Some(reply_to_raw)
    };

    let body = lines[separator_idx + 1..].join("\n").trim().to_string();

    Ok(ComposedEmail {
        to: split_addresses(header("to")),
        cc: split_addresses(header("cc")),
        bcc: split_addresses(header("bcc")),
        from_addr,
        from_name,
        reply_to,
        subject: header("subject").to_string(),
        body,
        cancelled: false,
    })
}

/// Splits a `Name <addr>` value into display name and address. A bare
/// value is all address; an empty name normalizes to `None`.
pub fn parse_mailbox(value: &str) -> (Option<String>, String) {
    let value = value.trim();
    match MAILBOX.captures(value) {
        Some(caps) => {
            let name = caps["name"].trim();
            let name = if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            };
            (name, caps["addr"].trim().to_string())
        }
        None => (None, value.to_string()),
    }
}

fn strip_annotation(value: &str) -> String {
    match value.find(ANNOTATION_START) {
        Some(idx) => value[..idx].trim().to_string(),
        None => value.trim().to_string(),
    }
}

fn split_addresses(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(String::from)
        .collect()
}
