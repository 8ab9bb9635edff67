//! Configuration file handling.
//!
//! The configuration is a TOML file (by default `~/.tmail.conf`) declaring
//! SMTP servers, sending identities and defaults:
//!
//! ```toml
//! [defaults]
//! default_identity = "Work"
//!
//! [[smtp_servers]]
//! name = "corp"
//! host = "smtp.example.com"
//! ports = [587, 465]
//! user = "jdoe"
//! password_cmd = "pass show smtp/corp"
//!
//! [[identities]]
//! name = "Work"
//! email = "jdoe@example.com"
//! display_name = "John Doe"
//! smtp_server = "corp"
//! reply_to = ["jdoe@example.com", "team@example.com"]
//! ```
//!
//! The loaded [`Config`] is immutable; all name lookups are case-insensitive
//! and resolved through maps of lowercased keys built once at load time.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;

/// Port tried when a server declares none.
pub const DEFAULT_SMTP_PORT: u16 = 587;
/// Retry count used when neither the CLI nor the config sets one.
pub const DEFAULT_RETRIES: u32 = 1;

const PASSWORD_CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Error loading or resolving configuration. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid TOML in config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("no SMTP servers configured in config file")]
    NoServers,
    #[error("no identities configured in config file")]
    NoIdentities,
    #[error("SMTP server '{0}' has an empty ports list")]
    EmptyPorts(String),
    #[error("SMTP server '{server}' has invalid password_encoding '{encoding}': must be 'plain' or 'base64'")]
    InvalidEncoding { server: String, encoding: String },
    #[error("identity '{identity}' references unknown SMTP server '{server}'")]
    UnknownServer { identity: String, server: String },
    #[error("default identity '{0}' not found")]
    UnknownDefaultIdentity(String),
    #[error("password command failed for SMTP server '{server}': {detail}")]
    PasswordCommand { server: String, detail: String },
    #[error("password command timed out for SMTP server '{0}'")]
    PasswordCommandTimeout(String),
    #[error("failed to decode base64 password for SMTP server '{server}': {detail}")]
    PasswordDecode { server: String, detail: String },
}

/// Declared encoding of a static password value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordEncoding {
    Plain,
    Base64,
}

/// Where a server's secret comes from.
///
/// Checked in declaration order: a command wins over a static value, and
/// the absence of both means anonymous sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordSource {
    /// Shell command whose first stdout line is the secret.
    Command(String),
    /// Static value, decoded per its declared encoding.
    Static {
        value: String,
        encoding: PasswordEncoding,
    },
    None,
}

/// SMTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpServer {
    /// Friendly name used for selection, unique case-insensitively.
    pub name: String,
    pub host: String,
    /// Candidate ports, tried in order. Never empty.
    pub ports: Vec<u16>,
    pub user: Option<String>,
    pub password: PasswordSource,
    /// Upgrade plain connections with STARTTLS. Port 465 always uses
    /// implicit TLS regardless of this flag.
    pub use_tls: bool,
}

impl SmtpServer {
    /// Resolves the server's secret, executing the password command or
    /// decoding the static value as configured.
    ///
    /// Returns `None` when no source is configured. Command failure,
    /// command timeout and malformed base64 are all fatal.
    pub fn resolve_password(&self) -> Result<Option<String>, ConfigError> {
        match &self.password {
            PasswordSource::Command(cmd) => {
                run_password_command(&self.name, cmd).map(Some)
            }
            PasswordSource::Static { value, encoding } => match encoding {
                PasswordEncoding::Plain => Ok(Some(value.clone())),
                PasswordEncoding::Base64 => {
                    let bytes =
                        base64::decode(value).map_err(|e| ConfigError::PasswordDecode {
                            server: self.name.clone(),
                            detail: e.to_string(),
                        })?;
                    let decoded =
                        String::from_utf8(bytes).map_err(|e| ConfigError::PasswordDecode {
                            server: self.name.clone(),
                            detail: e.to_string(),
                        })?;
                    Ok(Some(decoded))
                }
            },
            PasswordSource::None => Ok(None),
        }
    }
}

/// A sending persona bound to one SMTP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Friendly name used for selection, unique case-insensitively.
    pub name: String,
    pub email: String,
    /// Default display name, possibly empty.
    pub display_name: String,
    /// Name of the owning [`SmtpServer`]; resolved at load time.
    pub smtp_server: String,
    /// Allowed Reply-To addresses. Defaults to `[email]`. Never empty.
    pub reply_to: Vec<String>,
}

impl Identity {
    /// Renders the From header value, preferring a custom display name.
    pub fn format_from(&self, custom_display_name: Option<&str>) -> String {
        let name = custom_display_name.unwrap_or(&self.display_name);
        if name.is_empty() {
            self.email.clone()
        } else {
            format!("{} <{}>", name, self.email)
        }
    }
}

/// Default behavior knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub retries: u32,
    pub interactive: bool,
    pub skip_confirmation: bool,
    pub default_identity: Option<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Defaults {
            retries: DEFAULT_RETRIES,
            interactive: true,
            skip_confirmation: false,
            default_identity: None,
        }
    }
}

/// The loaded registry of servers, identities and defaults.
///
/// Read-only after loading.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub defaults: Defaults,
    pub smtp_servers: Vec<SmtpServer>,
    pub identities: Vec<Identity>,
    servers_by_name: HashMap<String, usize>,
    identities_by_name: HashMap<String, usize>,
    identities_by_email: HashMap<String, usize>,
}

impl Config {
    /// Loads and validates the configuration from `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        check_permissions(path);
        let text = std::fs::read_to_string(path)?;
        Config::from_toml_str(&text)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml_str(text: &str) -> Result<Config, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        Config::from_raw(raw)
    }

    /// An empty configuration, used when `-n` is passed or the config file
    /// is absent but the sender was given on the command line.
    pub fn empty() -> Config {
        Config::default()
    }

    fn from_raw(raw: RawConfig) -> Result<Config, ConfigError> {
        if raw.smtp_servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        if raw.identities.is_empty() {
            return Err(ConfigError::NoIdentities);
        }

        let smtp_servers = raw
            .smtp_servers
            .into_iter()
            .map(RawServer::validate)
            .collect::<Result<Vec<_>, _>>()?;

        let mut servers_by_name = HashMap::new();
        for (idx, server) in smtp_servers.iter().enumerate() {
            servers_by_name.insert(server.name.to_lowercase(), idx);
        }

        let identities = raw
            .identities
            .into_iter()
            .map(|identity| identity.validate(&servers_by_name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut identities_by_name = HashMap::new();
        let mut identities_by_email = HashMap::new();
        for (idx, identity) in identities.iter().enumerate() {
            identities_by_name.insert(identity.name.to_lowercase(), idx);
            identities_by_email.insert(identity.email.to_lowercase(), idx);
        }

        let defaults = Defaults {
            retries: raw.defaults.retries.unwrap_or(DEFAULT_RETRIES),
            interactive: raw.defaults.interactive.unwrap_or(true),
            skip_confirmation: raw.defaults.skip_confirmation.unwrap_or(false),
            default_identity: raw.defaults.default_identity,
        };

        if let Some(name) = &defaults.default_identity {
            if !identities_by_name.contains_key(&name.to_lowercase()) {
                return Err(ConfigError::UnknownDefaultIdentity(name.clone()));
            }
        }

        Ok(Config {
            defaults,
            smtp_servers,
            identities,
            servers_by_name,
            identities_by_name,
            identities_by_email,
        })
    }

    /// Finds an SMTP server by friendly name, case-insensitively.
    pub fn smtp_server(&self, name: &str) -> Option<&SmtpServer> {
        self.servers_by_name
            .get(&name.to_lowercase())
            .map(|&idx| &self.smtp_servers[idx])
    }

    /// Finds an identity by friendly name, case-insensitively.
    pub fn identity(&self, name: &str) -> Option<&Identity> {
        self.identities_by_name
            .get(&name.to_lowercase())
            .map(|&idx| &self.identities[idx])
    }

    /// Finds an identity by email address, case-insensitively.
    pub fn identity_by_email(&self, email: &str) -> Option<&Identity> {
        self.identities_by_email
            .get(&email.to_lowercase())
            .map(|&idx| &self.identities[idx])
    }

    /// The configured default identity, falling back to the first one in
    /// declaration order.
    pub fn default_identity(&self) -> Option<&Identity> {
        if let Some(name) = &self.defaults.default_identity {
            if let Some(identity) = self.identity(name) {
                return Some(identity);
            }
        }
        self.identities.first()
    }

    /// The SMTP server an identity sends through.
    pub fn smtp_for_identity(&self, identity: &Identity) -> Option<&SmtpServer> {
        self.smtp_server(&identity.smtp_server)
    }
}

/// The default config file location, `~/.tmail.conf`.
pub fn default_config_path() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    Path::new(&home).join(".tmail.conf")
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    smtp_servers: Vec<RawServer>,
    #[serde(default)]
    identities: Vec<RawIdentity>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDefaults {
    retries: Option<u32>,
    interactive: Option<bool>,
    skip_confirmation: Option<bool>,
    default_identity: Option<String>,
}

/// `ports = 587` and `ports = [587, 465]` are both accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Ports {
    One(u16),
    Many(Vec<u16>),
}

#[derive(Debug, Deserialize)]
struct RawServer {
    name: String,
    host: String,
    ports: Option<Ports>,
    user: Option<String>,
    password: Option<String>,
    password_cmd: Option<String>,
    password_encoding: Option<String>,
    use_tls: Option<bool>,
}

impl RawServer {
    fn validate(self) -> Result<SmtpServer, ConfigError> {
        let encoding = match self.password_encoding.as_deref() {
            None => PasswordEncoding::Plain,
            Some(tag) => match tag.to_lowercase().as_str() {
                "plain" => PasswordEncoding::Plain,
                "base64" => PasswordEncoding::Base64,
                _ => {
                    return Err(ConfigError::InvalidEncoding {
                        server: self.name,
                        encoding: tag.to_string(),
                    })
                }
            },
        };

        let password = match (self.password_cmd, self.password) {
            (Some(cmd), _) => PasswordSource::Command(cmd),
            (None, Some(value)) => PasswordSource::Static { value, encoding },
            (None, None) => PasswordSource::None,
        };

        let ports = match self.ports {
            None => vec![DEFAULT_SMTP_PORT],
            Some(Ports::One(port)) => vec![port],
            Some(Ports::Many(ports)) => {
                if ports.is_empty() {
                    return Err(ConfigError::EmptyPorts(self.name));
                }
                ports
            }
        };

        Ok(SmtpServer {
            name: self.name,
            host: self.host,
            ports,
            user: self.user,
            password,
            use_tls: self.use_tls.unwrap_or(true),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawIdentity {
    name: String,
    email: String,
    display_name: Option<String>,
    smtp_server: String,
    reply_to: Option<Vec<String>>,
}

impl RawIdentity {
    fn validate(self, servers_by_name: &HashMap<String, usize>) -> Result<Identity, ConfigError> {
        if !servers_by_name.contains_key(&self.smtp_server.to_lowercase()) {
            return Err(ConfigError::UnknownServer {
                identity: self.name,
                server: self.smtp_server,
            });
        }
        let reply_to = match self.reply_to {
            Some(list) if !list.is_empty() => list,
            _ => vec![self.email.clone()],
        };
        Ok(Identity {
            name: self.name,
            email: self.email,
            display_name: self.display_name.unwrap_or_default(),
            smtp_server: self.smtp_server,
            reply_to,
        })
    }
}

/// Runs a password command under `sh -c`, returning the first line of its
/// stdout. Bounded by [`PASSWORD_CMD_TIMEOUT`].
fn run_password_command(server: &str, cmd: &str) -> Result<String, ConfigError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ConfigError::PasswordCommand {
            server: server.to_string(),
            detail: e.to_string(),
        })?;

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if started.elapsed() >= PASSWORD_CMD_TIMEOUT {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ConfigError::PasswordCommandTimeout(server.to_string()));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                return Err(ConfigError::PasswordCommand {
                    server: server.to_string(),
                    detail: e.to_string(),
                })
            }
        }
    };

    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut stdout);
    }

    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr);
        }
        return Err(ConfigError::PasswordCommand {
            server: server.to_string(),
            detail: stderr.trim().to_string(),
        });
    }

    Ok(stdout.lines().next().unwrap_or("").trim().to_string())
}

/// Warns when the config file is readable by group or others, since it may
/// hold passwords. Never fails the load.
fn check_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if let Ok(metadata) = std::fs::metadata(path) {
            let mode = metadata.permissions().mode();
            if mode & 0o006 != 0 {
                tracing::warn!(
                    "config file {} is readable or writable by others; \
                     consider `chmod 600`",
                    path.display()
                );
            } else if mode & 0o060 != 0 {
                tracing::warn!(
                    "config file {} is readable or writable by group; \
                     consider `chmod 600`",
                    path.display()
                );
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [defaults]
        retries = 3
        default_identity = "work"

        [[smtp_servers]]
        name = "Corp"
        host = "smtp.example.com"
        ports = [587, 465]
        user = "jdoe"
        password = "hunter2"

        [[smtp_servers]]
        name = "other"
        host = "mail.other.example"

        [[identities]]
        name = "Work"
        email = "jdoe@example.com"
        display_name = "John Doe"
        smtp_server = "corp"
        reply_to = ["jdoe@example.com", "team@example.com"]

        [[identities]]
        name = "Personal"
        email = "john@home.example"
        smtp_server = "other"
    "#;

    #[test]
    fn loads_sample() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.defaults.retries, 3);
        assert_eq!(config.smtp_servers.len(), 2);
        assert_eq!(config.identities.len(), 2);
        assert_eq!(config.smtp_servers[0].ports, vec![587, 465]);
        assert!(config.smtp_servers[0].use_tls);
    }

    #[test]
    fn lookups_are_case_insensitive() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert!(config.smtp_server("CORP").is_some());
        assert!(config.identity("WORK").is_some());
        assert!(config.identity_by_email("JDOE@EXAMPLE.COM").is_some());
        assert!(config.smtp_server("nope").is_none());
    }

    #[test]
    fn default_identity_prefers_configured_name() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.default_identity().unwrap().name, "Work");
    }

    #[test]
    fn default_identity_falls_back_to_first() {
        let text = SAMPLE.replace("default_identity = \"work\"", "");
        let config = Config::from_toml_str(&text).unwrap();
        assert_eq!(config.default_identity().unwrap().name, "Work");
    }

    #[test]
    fn reply_to_defaults_to_email() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let personal = config.identity("personal").unwrap();
        assert_eq!(personal.reply_to, vec!["john@home.example"]);
    }

    #[test]
    fn identity_resolves_its_server() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let work = config.identity("work").unwrap();
        let server = config.smtp_for_identity(work).unwrap();
        assert_eq!(server.host, "smtp.example.com");
    }

    #[test]
    fn missing_servers_fails() {
        let err = Config::from_toml_str(
            r#"
            [[identities]]
            name = "a"
            email = "a@b.c"
            smtp_server = "x"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NoServers));
    }

    #[test]
    fn missing_identities_fails() {
        let err = Config::from_toml_str(
            r#"
            [[smtp_servers]]
            name = "a"
            host = "b"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::NoIdentities));
    }

    #[test]
    fn unknown_server_reference_fails() {
        let err = Config::from_toml_str(
            r#"
            [[smtp_servers]]
            name = "a"
            host = "b"

            [[identities]]
            name = "x"
            email = "x@y.z"
            smtp_server = "missing"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownServer { .. }));
    }

    #[test]
    fn unknown_default_identity_fails() {
        let text = SAMPLE.replace("default_identity = \"work\"", "default_identity = \"gone\"");
        let err = Config::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDefaultIdentity(_)));
    }

    #[test]
    fn invalid_encoding_fails() {
        let text = SAMPLE.replace(
            "password = \"hunter2\"",
            "password = \"hunter2\"\npassword_encoding = \"rot13\"",
        );
        let err = Config::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEncoding { .. }));
    }

    fn server_with_password(password: PasswordSource) -> SmtpServer {
        SmtpServer {
            name: "test".into(),
            host: "localhost".into(),
            ports: vec![DEFAULT_SMTP_PORT],
            user: None,
            password,
            use_tls: false,
        }
    }

    #[test]
    fn plain_password_passes_through() {
        let server = server_with_password(PasswordSource::Static {
            value: "secret123".into(),
            encoding: PasswordEncoding::Plain,
        });
        assert_eq!(server.resolve_password().unwrap().unwrap(), "secret123");
    }

    #[test]
    fn base64_password_decodes() {
        let server = server_with_password(PasswordSource::Static {
            value: "c2VjcmV0MTIz".into(),
            encoding: PasswordEncoding::Base64,
        });
        assert_eq!(server.resolve_password().unwrap().unwrap(), "secret123");
    }

    #[test]
    fn invalid_base64_password_fails() {
        let server = server_with_password(PasswordSource::Static {
            value: "not base64!".into(),
            encoding: PasswordEncoding::Base64,
        });
        assert!(matches!(
            server.resolve_password().unwrap_err(),
            ConfigError::PasswordDecode { .. }
        ));
    }

    #[test]
    fn no_password_source_is_anonymous() {
        let server = server_with_password(PasswordSource::None);
        assert_eq!(server.resolve_password().unwrap(), None);
    }

    #[test]
    #[cfg(unix)]
    fn password_command_takes_first_line() {
        let server = server_with_password(PasswordSource::Command(
            "printf 'secret123\\nextra'".into(),
        ));
        assert_eq!(server.resolve_password().unwrap().unwrap(), "secret123");
    }

    #[test]
    #[cfg(unix)]
    fn failing_password_command_is_fatal() {
        let server = server_with_password(PasswordSource::Command("exit 7".into()));
        assert!(matches!(
            server.resolve_password().unwrap_err(),
            ConfigError::PasswordCommand { .. }
        ));
    }

    #[test]
    fn command_wins_over_static_value() {
        let raw = RawServer {
            name: "a".into(),
            host: "b".into(),
            ports: None,
            user: None,
            password: Some("static".into()),
            password_cmd: Some("echo cmd".into()),
            password_encoding: None,
            use_tls: None,
        };
        let server = raw.validate().unwrap();
        assert_eq!(server.password, PasswordSource::Command("echo cmd".into()));
    }

    #[test]
    fn empty_ports_list_fails() {
        let text = SAMPLE.replace("ports = [587, 465]", "ports = []");
        let err = Config::from_toml_str(&text).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyPorts(_)));
    }

    #[test]
    fn format_from_with_and_without_name() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let work = config.identity("work").unwrap();
        assert_eq!(work.format_from(None), "John Doe <jdoe@example.com>");
        assert_eq!(work.format_from(Some("J.")), "J. <jdoe@example.com>");
        let personal = config.identity("personal").unwrap();
        assert_eq!(personal.format_from(None), "john@home.example");
    }
}
