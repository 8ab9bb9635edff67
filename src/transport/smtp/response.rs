//! SMTP reply parsing.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use nom::{
    branch::alt,
    character::complete::{char, one_of},
    IResult,
};

/// First digit of a reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    PositiveCompletion = 2,
    PositiveIntermediate = 3,
    TransientNegativeCompletion = 4,
    PermanentNegativeCompletion = 5,
}

/// Second digit of a reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Syntax = 0,
    Information = 1,
    Connections = 2,
    Unspecified3 = 3,
    Unspecified4 = 4,
    MailSystem = 5,
}

/// A three-digit SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code {
    pub severity: Severity,
    pub category: Category,
    pub detail: u8,
}

impl Code {
    pub fn new(severity: Severity, category: Category, detail: u8) -> Code {
        Code {
            severity,
            category,
            detail,
        }
    }

    /// Whether the code reports a positive outcome (2yz or 3yz).
    pub fn is_positive(self) -> bool {
        matches!(
            self.severity,
            Severity::PositiveCompletion | Severity::PositiveIntermediate
        )
    }
}

impl Display for Code {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.severity as u8, self.category as u8, self.detail
        )
    }
}

/// A complete, possibly multiline server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: Code,
    /// Text of each reply line, in order, without the code prefix.
    pub message: Vec<String>,
}

impl Response {
    pub fn new(code: Code, message: Vec<String>) -> Response {
        Response { code, message }
    }

    /// Whether the reply reports a positive outcome.
    pub fn is_positive(&self) -> bool {
        self.code.is_positive()
    }

    /// The first line of the reply text, if any.
    pub fn first_line(&self) -> Option<&str> {
        self.message.first().map(String::as_str)
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message.join(" "))
    }
}

/// One parsed reply line: its code, its text, and whether it terminates
/// the reply (a space separator) or continues it (a dash).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: Code,
    pub text: String,
    pub last: bool,
}

impl FromStr for ReplyLine {
    type Err = super::Error;

    fn from_str(line: &str) -> Result<ReplyLine, Self::Err> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        match reply_line(line) {
            Ok((text, (code, last))) => Ok(ReplyLine {
                code,
                text: text.to_string(),
                last,
            }),
            Err(_) => Err(super::Error::ResponseParse(line.to_string())),
        }
    }
}

fn severity(i: &str) -> IResult<&str, Severity> {
    let (i, digit) = one_of("2345")(i)?;
    let severity = match digit {
        '2' => Severity::PositiveCompletion,
        '3' => Severity::PositiveIntermediate,
        '4' => Severity::TransientNegativeCompletion,
        _ => Severity::PermanentNegativeCompletion,
    };
    Ok((i, severity))
}

fn category(i: &str) -> IResult<&str, Category> {
    let (i, digit) = one_of("012345")(i)?;
    let category = match digit {
        '0' => Category::Syntax,
        '1' => Category::Information,
        '2' => Category::Connections,
        '3' => Category::Unspecified3,
        '4' => Category::Unspecified4,
        _ => Category::MailSystem,
    };
    Ok((i, category))
}

fn code(i: &str) -> IResult<&str, Code> {
    let (i, severity) = severity(i)?;
    let (i, category) = category(i)?;
    let (i, detail) = one_of("0123456789")(i)?;
    Ok((
        i,
        Code::new(severity, category, detail.to_digit(10).unwrap() as u8),
    ))
}

/// `250-text` continues the reply, `250 text` or a bare `250` ends it.
fn reply_line(i: &str) -> IResult<&str, (Code, bool)> {
    let (i, code) = code(i)?;
    if i.is_empty() {
        return Ok((i, (code, true)));
    }
    let (i, separator) = alt((char(' '), char('-')))(i)?;
    Ok((i, (code, separator == ' ')))
}
