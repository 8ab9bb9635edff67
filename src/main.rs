//! Terminal Mail: send email from the command line.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tmail::compose::{confirm_send, read_body_from_stdin};
use tmail::config::{default_config_path, Config, ConfigError, Identity, SmtpServer};
use tmail::message::{build_message, format_summary, EmailData};
use tmail::template::Prefill;
use tmail::transport::smtp::Mailer;
use tmail::EditSession;

#[derive(Debug, Parser)]
#[command(
    name = "tmail",
    version,
    about = "Terminal Mail - Send email from the command line with SMTP configuration support."
)]
struct Cli {
    /// Email recipient address(es)
    #[arg(value_name = "recipient")]
    recipients: Vec<String>,

    /// Subject line of the message
    #[arg(short = 's', value_name = "subject")]
    subject: Option<String>,

    /// Carbon copy recipient (can be specified multiple times)
    #[arg(short = 'c', value_name = "addr")]
    cc: Vec<String>,

    /// Blind carbon copy recipient (can be specified multiple times)
    #[arg(short = 'b', value_name = "addr")]
    bcc: Vec<String>,

    /// From/envelope sender address
    #[arg(short = 'r', long = "from", value_name = "addr")]
    from_addr: Option<String>,

    /// Attach file (can be specified multiple times)
    #[arg(short = 'a', value_name = "file")]
    attachments: Vec<PathBuf>,

    /// Verbose mode - show SMTP transaction details
    #[arg(short = 'v')]
    verbose: bool,

    /// Do not read the config file
    #[arg(short = 'n')]
    no_config: bool,

    /// Discard messages with empty body
    #[arg(short = 'E')]
    discard_empty: bool,

    /// Path to config file (default: ~/.tmail.conf)
    #[arg(long, value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Identity to use by friendly name (e.g., 'Work Email')
    #[arg(long, value_name = "NAME")]
    identity: Option<String>,

    /// Custom display name for this email (overrides identity default)
    #[arg(long, value_name = "NAME")]
    display_name: Option<String>,

    /// Reply-To address
    #[arg(long, value_name = "addr")]
    reply_to: Option<String>,

    /// Enable/disable interactive mode (default: true)
    #[arg(long, value_name = "BOOL")]
    interactive: Option<bool>,

    /// Skip the final send confirmation prompt
    #[arg(long)]
    skip_confirmation: bool,

    /// Number of retry attempts (default: 1)
    #[arg(long, value_name = "N")]
    retries: Option<u32>,

    /// Show what would be sent without actually sending
    #[arg(long)]
    dry_run: bool,

    /// List configured accounts and exit
    #[arg(long)]
    list_accounts: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "tmail=debug" } else { "tmail=warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<u8, tmail::Error> {
    let config_path = cli
        .config_path
        .clone()
        .unwrap_or_else(default_config_path);

    let config = if cli.no_config {
        Config::empty()
    } else {
        match Config::load(&config_path) {
            Ok(config) => config,
            // A missing config file is tolerated when the sender is given
            // on the command line.
            Err(e @ ConfigError::NotFound(_)) if cli.from_addr.is_some() => {
                eprintln!("Warning: {}", e);
                Config::empty()
            }
            Err(e) => return Err(e.into()),
        }
    };

    if cli.list_accounts {
        return Ok(list_accounts(&config));
    }

    let interactive = cli.interactive.unwrap_or(config.defaults.interactive);
    let skip_confirmation = cli.skip_confirmation || config.defaults.skip_confirmation;
    let retries = cli.retries.unwrap_or(config.defaults.retries);

    // Resolve the identity: by friendly name, by sender address, or the
    // configured default.
    let mut identity: Option<&Identity> = None;
    if let Some(name) = &cli.identity {
        identity = config.identity(name);
        if identity.is_none() {
            eprintln!("Error: Identity '{}' not found.", name);
            eprintln!("Available identities: {}", identity_names(&config));
            return Ok(1);
        }
    } else if let Some(from_addr) = &cli.from_addr {
        identity = config.identity_by_email(from_addr);
        if identity.is_none() && !cli.no_config && !config.identities.is_empty() {
            eprintln!("Error: No identity configured for '{}'", from_addr);
            eprintln!("Available identities: {}", identity_emails(&config));
            return Ok(1);
        }
    } else if !config.identities.is_empty() {
        identity = config.default_identity();
    }

    if identity.is_none() && !cli.no_config && cli.from_addr.is_none() {
        eprintln!(
            "Error: No identity available. Configure an identity in ~/.tmail.conf or use --identity."
        );
        return Ok(1);
    }

    let mut smtp_server: Option<&SmtpServer> = None;
    if let Some(identity) = identity {
        smtp_server = config.smtp_for_identity(identity);
        if smtp_server.is_none() {
            eprintln!(
                "Error: SMTP server '{}' not found for identity '{}'.",
                identity.smtp_server, identity.name
            );
            return Ok(1);
        }
    }

    if let (Some(reply_to), Some(identity)) = (&cli.reply_to, identity) {
        if !identity.reply_to.contains(reply_to) {
            eprintln!(
                "Warning: Reply-To '{}' not in allowed list for '{}'.",
                reply_to, identity.name
            );
            eprintln!("Allowed: {}", identity.reply_to.join(", "));
        }
    }

    let email_data = if interactive && std::io::stdin().is_terminal() {
        let prefill = Prefill {
            to: &cli.recipients,
            cc: &cli.cc,
            bcc: &cli.bcc,
            identity: identity.map(|i| i.name.as_str()),
            reply_to: cli.reply_to.as_deref(),
            subject: cli.subject.as_deref(),
            body: None,
            display_name: cli.display_name.as_deref(),
        };
        let composed = EditSession::new().compose(&config, &prefill)?;

        if composed.cancelled {
            println!("Email composition cancelled.");
            return Ok(0);
        }

        // The user may have picked another From line in the editor.
        if !composed.from_addr.is_empty() {
            if let Some(new_identity) = config.identity_by_email(&composed.from_addr) {
                identity = Some(new_identity);
                smtp_server = config.smtp_for_identity(new_identity);
            }
        }

        let effective_display_name = composed
            .from_name
            .clone()
            .or_else(|| cli.display_name.clone())
            .or_else(|| identity.and_then(display_name_of));

        EmailData {
            to: composed.to,
            cc: composed.cc,
            bcc: composed.bcc,
            from_addr: composed.from_addr,
            from_name: effective_display_name,
            reply_to: composed.reply_to,
            subject: composed.subject,
            body: composed.body,
            attachments: cli.attachments.clone(),
        }
    } else {
        let body = read_body_from_stdin();
        let effective_display_name = cli
            .display_name
            .clone()
            .or_else(|| identity.and_then(display_name_of));

        EmailData {
            to: cli.recipients.clone(),
            cc: cli.cc.clone(),
            bcc: cli.bcc.clone(),
            from_addr: cli
                .from_addr
                .clone()
                .or_else(|| identity.map(|i| i.email.clone()))
                .unwrap_or_default(),
            from_name: effective_display_name,
            reply_to: cli.reply_to.clone(),
            subject: cli.subject.clone().unwrap_or_default(),
            body,
            attachments: cli.attachments.clone(),
        }
    };

    if email_data.is_empty() {
        if cli.discard_empty {
            if cli.verbose {
                println!("Message body is empty, discarding.");
            }
            return Ok(0);
        }
        eprintln!("Warning: Message body is empty.");
    }

    let errors = email_data.validate();
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("Error: {}", error);
        }
        return Ok(1);
    }

    if cli.dry_run {
        println!("DRY RUN - Email would be sent:");
        println!("{}", format_summary(&email_data));
        if let Some(server) = smtp_server {
            println!("\nUsing SMTP: {} ({})", server.name, server.host);
        }
        return Ok(0);
    }

    if !skip_confirmation && std::io::stdin().is_terminal() && !confirm_send(&email_data) {
        println!("Email not sent.");
        return Ok(0);
    }

    let Some(smtp_server) = smtp_server else {
        eprintln!("Error: No SMTP server available for sending.");
        return Ok(1);
    };

    let message = build_message(&email_data)?;
    let recipients = email_data.all_recipients();

    if cli.verbose {
        println!(
            "Sending email via {} ({})...",
            smtp_server.name, smtp_server.host
        );
    }

    let result = Mailer::new().send(&message, &recipients, smtp_server, retries)?;
    if result.success {
        println!("{}", result.message);
        Ok(0)
    } else {
        eprintln!("Error: {}", result.message);
        Ok(1)
    }
}

fn display_name_of(identity: &Identity) -> Option<String> {
    if identity.display_name.is_empty() {
        None
    } else {
        Some(identity.display_name.clone())
    }
}

fn identity_names(config: &Config) -> String {
    config
        .identities
        .iter()
        .map(|i| i.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn identity_emails(config: &Config) -> String {
    config
        .identities
        .iter()
        .map(|i| format!("{} ({})", i.name, i.email))
        .collect::<Vec<_>>()
        .join(", ")
}

fn list_accounts(config: &Config) -> u8 {
    if config.identities.is_empty() {
        println!("No identities configured.");
        return 0;
    }

    println!("SMTP Servers:");
    for server in &config.smtp_servers {
        println!("  [{}]", server.name);
        println!("    Host: {}", server.host);
        println!(
            "    Ports: {}",
            server
                .ports
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    println!("\nIdentities:");
    for identity in &config.identities {
        let default_marker = if config.defaults.default_identity.as_deref()
            == Some(identity.name.as_str())
        {
            " (default)"
        } else {
            ""
        };
        println!("  [{}]{}", identity.name, default_marker);
        println!("    Email: {}", identity.email);
        println!(
            "    Display Name: {}",
            if identity.display_name.is_empty() {
                "(none)"
            } else {
                &identity.display_name
            }
        );
        println!("    SMTP Server: {}", identity.smtp_server);
        println!("    Reply-To options: {}", identity.reply_to.join(", "));
    }
    0
}
