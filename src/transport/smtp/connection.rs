//! A blocking SMTP client connection.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;

use native_tls::{TlsConnector, TlsStream};
use tracing::debug;

use super::authentication::{Credentials, Mechanism, DEFAULT_MECHANISMS};
use super::response::{ReplyLine, Response, Severity};
use super::Error;

/// A plain or TLS-wrapped TCP stream.
enum NetworkStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Read for NetworkStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            NetworkStream::Plain(stream) => stream.read(buf),
            NetworkStream::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for NetworkStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            NetworkStream::Plain(stream) => stream.write(buf),
            NetworkStream::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            NetworkStream::Plain(stream) => stream.flush(),
            NetworkStream::Tls(stream) => stream.flush(),
        }
    }
}

/// Server capabilities learned from the EHLO reply.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    features: Vec<String>,
}

impl ServerInfo {
    /// The first reply line is the server greeting; the rest are features.
    fn from_response(response: &Response) -> ServerInfo {
        ServerInfo {
            features: response.message.iter().skip(1).cloned().collect(),
        }
    }

    pub fn supports_feature(&self, keyword: &str) -> bool {
        self.features.iter().any(|feature| {
            let mut words = feature.split_whitespace();
            words.next().map_or(false, |w| w.eq_ignore_ascii_case(keyword))
        })
    }

    /// Mechanisms advertised by the `AUTH` keyword that we implement.
    pub fn auth_mechanisms(&self) -> Vec<Mechanism> {
        self.features
            .iter()
            .filter_map(|feature| {
                let mut words = feature.split_whitespace();
                match words.next() {
                    Some(w) if w.eq_ignore_ascii_case("AUTH") => Some(words),
                    _ => None,
                }
            })
            .flatten()
            .filter_map(|word| {
                DEFAULT_MECHANISMS
                    .iter()
                    .copied()
                    .find(|m| m.as_str().eq_ignore_ascii_case(word))
            })
            .collect()
    }
}

/// One SMTP session. Commands are written and replies read synchronously;
/// negative replies surface as [`Error::Transient`] or [`Error::Permanent`].
pub struct SmtpConnection {
    stream: BufReader<NetworkStream>,
    server_info: ServerInfo,
}

impl SmtpConnection {
    /// Opens a plain connection and consumes the greeting.
    pub fn connect(host: &str, port: u16) -> Result<SmtpConnection, Error> {
        let tcp = TcpStream::connect((host, port))?;
        SmtpConnection::with_stream(NetworkStream::Plain(tcp))
    }

    /// Opens an implicit-TLS (SMTPS) connection and consumes the greeting.
    pub fn connect_tls(host: &str, port: u16) -> Result<SmtpConnection, Error> {
        let connector = TlsConnector::new()?;
        let tcp = TcpStream::connect((host, port))?;
        let tls = connector
            .connect(host, tcp)
            .map_err(|e| Error::Handshake(e.to_string()))?;
        SmtpConnection::with_stream(NetworkStream::Tls(Box::new(tls)))
    }

    fn with_stream(stream: NetworkStream) -> Result<SmtpConnection, Error> {
        let mut conn = SmtpConnection {
            stream: BufReader::new(stream),
            server_info: ServerInfo::default(),
        };
        conn.read_response()?;
        Ok(conn)
    }

    /// Sends EHLO and records the advertised features.
    pub fn ehlo(&mut self, hello_name: &str) -> Result<(), Error> {
        let response = self.command(&format!("EHLO {}", hello_name))?;
        self.server_info = ServerInfo::from_response(&response);
        Ok(())
    }

    pub fn can_starttls(&self) -> bool {
        self.server_info.supports_feature("STARTTLS")
    }

    /// Upgrades the connection with STARTTLS, consuming it. The caller
    /// must EHLO again on the returned connection.
    pub fn starttls(mut self, domain: &str) -> Result<SmtpConnection, Error> {
        if !self.can_starttls() {
            return Err(Error::StartTlsNotSupported);
        }
        self.command("STARTTLS")?;
        let tcp = match self.stream.into_inner() {
            NetworkStream::Plain(tcp) => tcp,
            NetworkStream::Tls(_) => return Err(Error::Client("connection already encrypted")),
        };
        let connector = TlsConnector::new()?;
        let tls = connector
            .connect(domain, tcp)
            .map_err(|e| Error::Handshake(e.to_string()))?;
        Ok(SmtpConnection {
            stream: BufReader::new(NetworkStream::Tls(Box::new(tls))),
            server_info: ServerInfo::default(),
        })
    }

    /// Authenticates with the first mechanism both sides support.
    pub fn auth(&mut self, credentials: &Credentials) -> Result<(), Error> {
        let supported = self.server_info.auth_mechanisms();
        let mechanism = DEFAULT_MECHANISMS
            .iter()
            .copied()
            .find(|m| supported.contains(m))
            .ok_or(Error::NoCommonAuthMechanism)?;

        let mut response = if mechanism.supports_initial_response() {
            let initial = base64::encode(mechanism.response(credentials, None)?);
            self.write_line(
                &format!("AUTH {} {}", mechanism.as_str(), initial),
                &format!("AUTH {} ***", mechanism.as_str()),
            )?;
            self.read_response()?
        } else {
            self.command(&format!("AUTH {}", mechanism.as_str()))?
        };

        while response.code.severity == Severity::PositiveIntermediate {
            let challenge = decode_challenge(response.first_line().unwrap_or(""))?;
            let answer = base64::encode(mechanism.response(credentials, Some(challenge.trim()))?);
            self.write_line(&answer, "***")?;
            response = self.read_response()?;
        }
        Ok(())
    }

    /// Transmits a message: MAIL FROM, RCPT TO for every recipient, DATA.
    ///
    /// Any refused recipient fails the whole cycle before DATA is issued;
    /// no partial delivery is reported as success.
    pub fn send(
        &mut self,
        from: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<Response, Error> {
        self.command(&format!("MAIL FROM:<{}>", from))?;

        let mut refused = Vec::new();
        for recipient in recipients {
            match self.command(&format!("RCPT TO:<{}>", recipient)) {
                Ok(_) => {}
                Err(Error::Transient(_)) | Err(Error::Permanent(_)) => {
                    refused.push(recipient.clone());
                }
                Err(e) => return Err(e),
            }
        }
        if !refused.is_empty() {
            return Err(Error::RecipientsRefused(refused.join(", ")));
        }

        self.command("DATA")?;
        let body = dot_stuff(message);
        debug!("C: ({} message bytes)", body.len());
        let stream = self.stream.get_mut();
        stream.write_all(&body)?;
        stream.write_all(b".\r\n")?;
        stream.flush()?;
        self.read_response()
    }

    /// No-op command; its reply text serves as the delivery acknowledgment.
    pub fn noop(&mut self) -> Result<Response, Error> {
        self.command("NOOP")
    }

    pub fn quit(&mut self) -> Result<Response, Error> {
        self.command("QUIT")
    }

    /// Writes one command line and reads the full reply.
    pub fn command(&mut self, cmd: &str) -> Result<Response, Error> {
        self.write_line(cmd, cmd)?;
        self.read_response()
    }

    fn write_line(&mut self, data: &str, log: &str) -> Result<(), Error> {
        debug!("C: {}", log);
        let stream = self.stream.get_mut();
        stream.write_all(data.as_bytes())?;
        stream.write_all(b"\r\n")?;
        stream.flush()?;
        Ok(())
    }

    /// Reads reply lines until the final one, erroring on negative codes.
    fn read_response(&mut self) -> Result<Response, Error> {
        let mut message = Vec::new();
        loop {
            let mut line = String::new();
            if self.stream.read_line(&mut line)? == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }
            debug!("S: {}", line.trim_end());
            let reply: ReplyLine = line.parse()?;
            message.push(reply.text);
            if reply.last {
                let response = Response::new(reply.code, message);
                return if response.is_positive() {
                    Ok(response)
                } else {
                    Err(Error::from_response(response))
                };
            }
        }
    }
}

fn decode_challenge(challenge: &str) -> Result<String, Error> {
    let bytes =
        base64::decode(challenge).map_err(|_| Error::Client("malformed base64 challenge"))?;
    String::from_utf8(bytes).map_err(|_| Error::Client("challenge is not valid UTF-8"))
}

/// SMTP transparency: lines starting with a dot are dot-doubled and the
/// message always ends with CRLF.
fn dot_stuff(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 2);
    let mut at_line_start = true;
    for &byte in message {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::smtp::response::{Category, Code};

    #[test]
    fn dot_stuffing_doubles_leading_dots() {
        let stuffed = dot_stuff(b"one\r\n.two\r\n..three\r\n");
        assert_eq!(&stuffed, b"one\r\n..two\r\n...three\r\n");
    }

    #[test]
    fn dot_stuffing_terminates_with_crlf() {
        assert_eq!(dot_stuff(b"no newline"), b"no newline\r\n");
        assert_eq!(dot_stuff(b"kept\r\n"), b"kept\r\n");
    }

    fn ehlo_response(features: &[&str]) -> Response {
        let mut message = vec!["mock greets you".to_string()];
        message.extend(features.iter().map(|f| f.to_string()));
        Response::new(
            Code::new(Severity::PositiveCompletion, Category::MailSystem, 0),
            message,
        )
    }

    #[test]
    fn server_info_parses_features() {
        let info = ServerInfo::from_response(&ehlo_response(&["STARTTLS", "SIZE 35882577"]));
        assert!(info.supports_feature("STARTTLS"));
        assert!(info.supports_feature("starttls"));
        assert!(info.supports_feature("SIZE"));
        assert!(!info.supports_feature("AUTH"));
        assert!(info.auth_mechanisms().is_empty());
    }

    #[test]
    fn server_info_parses_auth_mechanisms() {
        let info = ServerInfo::from_response(&ehlo_response(&["AUTH CRAM-MD5 PLAIN LOGIN"]));
        assert_eq!(
            info.auth_mechanisms(),
            vec![Mechanism::Plain, Mechanism::Login]
        );
    }
}
