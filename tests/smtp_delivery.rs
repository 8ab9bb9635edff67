//! Delivery engine tests against an in-process mock SMTP server.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tmail::message::{build_message, EmailData};
use tmail::transport::smtp::Mailer;
use tmail::Config;

type CommandLog = Arc<Mutex<Vec<String>>>;

/// Spawns a one-session mock server. Recipients whose address contains
/// any string in `refuse` get a 550 reply.
fn spawn_mock(refuse: &[&str]) -> (u16, CommandLog) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let refuse: Vec<String> = refuse.iter().map(|s| s.to_string()).collect();
    let log: CommandLog = Arc::new(Mutex::new(Vec::new()));
    let session_log = Arc::clone(&log);
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            let _ = handle_session(stream, &refuse, &session_log);
        }
    });
    (port, log)
}

fn handle_session(
    stream: TcpStream,
    refuse: &[String],
    log: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    writer.write_all(b"220 mock ESMTP\r\n")?;

    let mut in_data = false;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end().to_string();
        if in_data {
            if trimmed == "." {
                in_data = false;
                writer.write_all(b"250 2.0.0 accepted\r\n")?;
            }
            continue;
        }
        log.lock().unwrap().push(trimmed.clone());
        let upper = trimmed.to_uppercase();
        if upper.starts_with("EHLO") {
            writer.write_all(b"250-mock greets you\r\n250-AUTH PLAIN LOGIN\r\n250 OK\r\n")?;
        } else if upper.starts_with("AUTH") {
            writer.write_all(b"235 2.7.0 accepted\r\n")?;
        } else if upper.starts_with("MAIL FROM") {
            writer.write_all(b"250 sender ok\r\n")?;
        } else if upper.starts_with("RCPT TO") {
            if refuse.iter().any(|r| trimmed.contains(r.as_str())) {
                writer.write_all(b"550 5.1.1 no such user\r\n")?;
            } else {
                writer.write_all(b"250 recipient ok\r\n")?;
            }
        } else if upper.starts_with("DATA") {
            in_data = true;
            writer.write_all(b"354 go ahead\r\n")?;
        } else if upper.starts_with("NOOP") {
            writer.write_all(b"250 2.0.0 OK\r\n")?;
        } else if upper.starts_with("QUIT") {
            writer.write_all(b"221 bye\r\n")?;
            return Ok(());
        } else {
            writer.write_all(b"500 unrecognized\r\n")?;
        }
    }
}

/// A port that refuses connections: bound once, then released.
fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn config_with_ports(ports: &[u16], server_extra: &str) -> Config {
    let ports = ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Config::from_toml_str(&format!(
        r#"
        [[smtp_servers]]
        name = "mock"
        host = "127.0.0.1"
        ports = [{ports}]
        use_tls = false
        {server_extra}

        [[identities]]
        name = "Test"
        email = "sender@example.com"
        smtp_server = "mock"
        "#
    ))
    .unwrap()
}

fn sample_email(to: &[&str]) -> EmailData {
    EmailData {
        to: to.iter().map(|s| s.to_string()).collect(),
        from_addr: "sender@example.com".to_string(),
        subject: "test".to_string(),
        body: "hello over the wire\n.leading dot line".to_string(),
        ..EmailData::default()
    }
}

fn fast_mailer() -> Mailer {
    Mailer::new().backoff_unit(Duration::from_millis(1))
}

#[test]
fn delivers_on_first_attempt() {
    let (port, log) = spawn_mock(&[]);
    let config = config_with_ports(&[port], "");
    let server = config.smtp_server("mock").unwrap();
    let message = build_message(&sample_email(&["rcpt@example.com"])).unwrap();

    let result = fast_mailer()
        .send(&message, &["rcpt@example.com".to_string()], server, 1)
        .unwrap();

    assert!(result.success, "{}", result.message);
    assert_eq!(result.attempts, 1);
    assert!(result.message.contains(&format!("127.0.0.1:{port}")));
    assert!(result.smtp_response.as_deref().unwrap().starts_with("250"));

    let log = log.lock().unwrap();
    assert!(log.iter().any(|l| l == "MAIL FROM:<sender@example.com>"));
    assert!(log.iter().any(|l| l == "RCPT TO:<rcpt@example.com>"));
    assert!(log.iter().any(|l| l == "QUIT"));
}

#[test]
fn falls_back_to_next_port_within_one_attempt() {
    let (port, _log) = spawn_mock(&[]);
    let config = config_with_ports(&[dead_port(), port], "");
    let server = config.smtp_server("mock").unwrap();
    let message = build_message(&sample_email(&["rcpt@example.com"])).unwrap();

    let result = fast_mailer()
        .send(&message, &["rcpt@example.com".to_string()], server, 0)
        .unwrap();

    assert!(result.success, "{}", result.message);
    assert_eq!(result.attempts, 1);
}

#[test]
fn exhausts_retries_and_reports_failure() {
    let config = config_with_ports(&[dead_port()], "");
    let server = config.smtp_server("mock").unwrap();
    let message = build_message(&sample_email(&["rcpt@example.com"])).unwrap();

    let result = fast_mailer()
        .send(&message, &["rcpt@example.com".to_string()], server, 2)
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    assert!(result.message.contains("after 3 attempt(s)"));
    assert!(result.smtp_response.is_none());
}

#[test]
fn backoff_waits_double_between_attempts() {
    let unit = Duration::from_millis(50);
    let config = config_with_ports(&[dead_port()], "");
    let server = config.smtp_server("mock").unwrap();
    let message = build_message(&sample_email(&["rcpt@example.com"])).unwrap();

    let start = Instant::now();
    let result = Mailer::new()
        .backoff_unit(unit)
        .send(&message, &["rcpt@example.com".to_string()], server, 2)
        .unwrap();
    let elapsed = start.elapsed();

    assert!(!result.success);
    assert_eq!(result.attempts, 3);
    // Waits of 1 and 2 units separate the three attempts; connecting to
    // the dead port itself is near-instant.
    assert!(elapsed >= unit * 3, "elapsed {elapsed:?}");
    assert!(elapsed < unit * 7, "elapsed {elapsed:?}");
}

#[test]
fn refused_recipient_fails_the_delivery() {
    let (port, log) = spawn_mock(&["blocked@example.com"]);
    let config = config_with_ports(&[port], "");
    let server = config.smtp_server("mock").unwrap();
    let message =
        build_message(&sample_email(&["ok@example.com", "blocked@example.com"])).unwrap();

    let recipients = vec![
        "ok@example.com".to_string(),
        "blocked@example.com".to_string(),
    ];
    let result = fast_mailer().send(&message, &recipients, server, 0).unwrap();

    assert!(!result.success);
    assert!(result.message.contains("blocked@example.com"));
    // The failed session is still terminated cleanly.
    let log = log.lock().unwrap();
    assert!(!log.iter().any(|l| l == "DATA"));
    assert!(log.iter().any(|l| l == "QUIT"));
}

#[test]
fn authenticates_before_sending() {
    let (port, log) = spawn_mock(&[]);
    let extra = "user = \"user\"\npassword = \"pass\"";
    let config = config_with_ports(&[port], extra);
    let server = config.smtp_server("mock").unwrap();
    let message = build_message(&sample_email(&["rcpt@example.com"])).unwrap();

    let result = fast_mailer()
        .send(&message, &["rcpt@example.com".to_string()], server, 0)
        .unwrap();

    assert!(result.success, "{}", result.message);
    // AUTH PLAIN with the base64 of "\0user\0pass".
    let log = log.lock().unwrap();
    assert!(log.iter().any(|l| l == "AUTH PLAIN AHVzZXIAcGFzcw=="));
}

#[test]
fn anonymous_when_no_credentials_configured() {
    let (port, log) = spawn_mock(&[]);
    let config = config_with_ports(&[port], "");
    let server = config.smtp_server("mock").unwrap();
    let message = build_message(&sample_email(&["rcpt@example.com"])).unwrap();

    let result = fast_mailer()
        .send(&message, &["rcpt@example.com".to_string()], server, 0)
        .unwrap();

    assert!(result.success, "{}", result.message);
    let log = log.lock().unwrap();
    assert!(!log.iter().any(|l| l.starts_with("AUTH")));
}

#[test]
fn test_connection_probes_without_sending() {
    let (port, log) = spawn_mock(&[]);
    let config = config_with_ports(&[port], "");
    let server = config.smtp_server("mock").unwrap();

    let result = fast_mailer().test_connection(server).unwrap();

    assert!(result.success, "{}", result.message);
    assert_eq!(result.attempts, 1);
    let log = log.lock().unwrap();
    assert!(log.iter().any(|l| l.starts_with("EHLO")));
    assert!(!log.iter().any(|l| l.starts_with("MAIL FROM")));
}

#[test]
fn test_connection_reports_unreachable_server() {
    let config = config_with_ports(&[dead_port()], "");
    let server = config.smtp_server("mock").unwrap();

    let result = fast_mailer().test_connection(server).unwrap();
    assert!(!result.success);
    assert!(result.message.contains("could not connect"));
}
