//! Interactive composition through an external editor.
//!
//! An [`EditSession`] writes the generated template to a transient file,
//! blocks on the user's editor, and decides what happened from the file's
//! modification time: an untouched file means the user cancelled, a
//! modified file is parsed back into a [`ComposedEmail`]. The temporary
//! file is removed on every exit path; removal failures are swallowed.

use std::fs;
use std::io::{self, BufRead, IsTerminal, Read, Write};
use std::process::Command;

use tracing::debug;

use crate::config::Config;
use crate::message::EmailData;
use crate::template::{self, ComposedEmail, Prefill, TemplateError};

const FALLBACK_EDITOR: &str = "vi";

/// Error during interactive composition. Fatal to the current compose
/// attempt; the user recovers by re-running.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("editor exited with code {0}")]
    EditorExit(i32),
    #[error("failed to launch editor '{editor}': {source}")]
    EditorLaunch {
        editor: String,
        source: io::Error,
    },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("failed to access edit buffer: {0}")]
    Io(#[from] io::Error),
}

/// The user's preferred editor: `$VISUAL`, then `$EDITOR`, then `vi`.
pub fn editor_command() -> String {
    for var in ["VISUAL", "EDITOR"] {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                return value;
            }
        }
    }
    FALLBACK_EDITOR.to_string()
}

/// One editing session against a transient template file.
#[derive(Debug, Clone)]
pub struct EditSession {
    editor: String,
}

impl EditSession {
    /// A session using the editor from the environment.
    pub fn new() -> EditSession {
        EditSession {
            editor: editor_command(),
        }
    }

    /// A session using a fixed editor command. The command may carry
    /// leading arguments, e.g. `"code -w"`.
    pub fn with_editor<S: Into<String>>(editor: S) -> EditSession {
        EditSession {
            editor: editor.into(),
        }
    }

    /// Generates the template, opens the editor and parses the result.
    ///
    /// Returns a cancelled [`ComposedEmail`] when the file was left
    /// unmodified; this is not an error.
    pub fn compose(
        &self,
        config: &Config,
        prefill: &Prefill<'_>,
    ) -> Result<ComposedEmail, ComposeError> {
        let template = template::generate(config, prefill);

        // NamedTempFile removes the file when dropped, on every exit path.
        let mut file = tempfile::Builder::new()
            .prefix("tmail-")
            .suffix(".tmail")
            .tempfile()?;
        file.write_all(template.as_bytes())?;
        file.flush()?;
        let path = file.path();

        let mtime_before = fs::metadata(path)?.modified()?;

        let mut parts = self.editor.split_whitespace();
        let program = parts.next().unwrap_or(FALLBACK_EDITOR);
        debug!(editor = %self.editor, path = %path.display(), "opening editor");
        let status = Command::new(program)
            .args(parts)
            .arg(path)
            .status()
            .map_err(|source| ComposeError::EditorLaunch {
                editor: self.editor.clone(),
                source,
            })?;

        if !status.success() {
            return Err(ComposeError::EditorExit(status.code().unwrap_or(-1)));
        }

        let mtime_after = fs::metadata(path)?.modified()?;
        if mtime_after == mtime_before {
            debug!("template unmodified, treating as cancelled");
            return Ok(ComposedEmail::cancelled());
        }

        let content = fs::read_to_string(path)?;
        Ok(template::parse(&content)?)
    }
}

impl Default for EditSession {
    fn default() -> Self {
        EditSession::new()
    }
}

/// Prints a summary and asks for confirmation before sending.
///
/// Empty input and `y`/`yes` confirm; `n`/`no` or end of input decline.
pub fn confirm_send(data: &EmailData) -> bool {
    let rule = "=".repeat(60);
    println!("\n{rule}");
    println!("EMAIL SUMMARY");
    println!("{rule}");
    println!("{}", crate::message::format_summary(data));
    println!("{rule}");

    let stdin = io::stdin();
    loop {
        print!("\nSend this email? [Y/n] ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => {
                println!();
                return false;
            }
            Ok(_) => {}
        }
        match line.trim().to_lowercase().as_str() {
            "" | "y" | "yes" => return true,
            "n" | "no" => return false,
            _ => println!("Please answer 'y' or 'n'"),
        }
    }
}

/// Reads the message body from stdin, up to end of input.
pub fn read_body_from_stdin() -> String {
    if io::stdin().is_terminal() {
        println!("Enter message body (Ctrl+D to finish):");
    }
    let mut body = String::new();
    let _ = io::stdin().read_to_string(&mut body);
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_editor_keeps_arguments() {
        let session = EditSession::with_editor("code -w");
        assert_eq!(session.editor, "code -w");
    }
}
