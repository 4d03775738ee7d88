//! `link-phone` command-line tool
//!
//! ```text
//! link-phone normalize "07912 345678"
//! link-phone --api-url https://practice.example.com/api provision
//! link-phone simulate --number 07912345678 --talk-secs 5 --client-id client-42
//! ```
//!
//! `simulate` runs one outbound call end to end over the loopback adapter.
//! The completed call is posted to the backend when an API URL is
//! configured, otherwise it is recorded locally. Either way the log record
//! is printed as JSON on stdout; logs go to stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use link_phone_core::{
    BackendClient, CallAssociation, CallLogRecord, LoopbackAdapter, PhoneConfig, PhoneEvent,
    Provisioner, RecordingCallLogger, SessionId, Softphone, StaticProvisioner,
};

#[derive(Parser, Debug)]
#[command(name = "link-phone", author, version, about = "Link softphone call-session tool")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "LINK_PHONE_CONFIG")]
    config: Option<PathBuf>,

    /// Backend API base URL, overrides the configuration file
    #[arg(long, env = "LINK_PHONE_API_URL")]
    api_url: Option<String>,

    /// Bearer token for the backend API
    #[arg(long, env = "LINK_PHONE_API_TOKEN", hide_env_values = true)]
    api_token: Option<String>,

    /// Home country calling code used for national numbers
    #[arg(long, env = "LINK_PHONE_COUNTRY_CODE")]
    country_code: Option<String>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print numbers in E.164 form
    Normalize {
        #[arg(required = true)]
        numbers: Vec<String>,
    },

    /// Fetch SIP credentials from the backend
    Provision,

    /// Place a loopback call and log it on hangup
    Simulate {
        /// Number to dial
        #[arg(long)]
        number: String,

        /// Seconds between answer and remote hangup
        #[arg(long, default_value_t = 5)]
        talk_secs: u64,

        /// Client the call is attributed to
        #[arg(long, env = "LINK_PHONE_CLIENT_ID")]
        client_id: Option<String>,

        /// Person within the client
        #[arg(long)]
        person_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.json_logs)?;
    let config = load_config(&cli)?;
    debug!(api_base_url = %config.api_base_url, country_code = %config.country_code, "Configuration loaded");

    match cli.command {
        Command::Normalize { numbers } => normalize(&config, &numbers),
        Command::Provision => provision(&config).await,
        Command::Simulate {
            number,
            talk_secs,
            client_id,
            person_id,
        } => {
            let association = CallAssociation {
                client_id,
                person_id,
            };
            let use_backend = cli.api_url.is_some() || cli.config.is_some();
            let record =
                simulate(config, association, &number, Duration::from_secs(talk_secs), use_backend).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(format!("link_phone={level}"))
            .with_context(|| format!("invalid log level {level:?}"))?,
    };
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<PhoneConfig> {
    let mut config = match &cli.config {
        Some(path) => PhoneConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PhoneConfig::default(),
    };
    if let Some(url) = &cli.api_url {
        config = config.with_api_base_url(url.clone());
    }
    if let Some(token) = &cli.api_token {
        config = config.with_api_token(token.clone());
    }
    if let Some(code) = &cli.country_code {
        config = config.with_country_code(code.clone());
    }
    config.validate()?;
    Ok(config)
}

fn normalize(config: &PhoneConfig, numbers: &[String]) -> Result<()> {
    let mut failed = 0;
    for raw in numbers {
        match link_phone_core::normalize_phone_number(raw, &config.country_code) {
            Ok(normalized) => println!("{raw}\t{normalized}"),
            Err(e) => {
                eprintln!("{raw}\t{e}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} numbers could not be normalised", numbers.len());
    }
    Ok(())
}

async fn provision(config: &PhoneConfig) -> Result<()> {
    let backend = BackendClient::new(config)?;
    info!(base_url = backend.base_url(), "Requesting SIP credentials");
    let mut credentials = backend.provision().await?;
    credentials.password = "<redacted>".to_string();
    println!("{}", serde_json::to_string_pretty(&credentials)?);
    Ok(())
}

async fn simulate(
    config: PhoneConfig,
    association: CallAssociation,
    number: &str,
    talk_time: Duration,
    use_backend: bool,
) -> Result<CallLogRecord> {
    let adapter = LoopbackAdapter::new();
    let remote = adapter.remote();
    let wait_for_log = config.request_timeout() + Duration::from_secs(1);

    let builder = Softphone::builder()
        .adapter(adapter)
        .association(association)
        .provisioner(StaticProvisioner::new(LoopbackAdapter::credentials()));
    let builder = if use_backend {
        info!(base_url = %config.api_base_url, "Call will be logged to the backend");
        builder.call_logger(BackendClient::new(&config)?)
    } else {
        info!("No backend configured, recording the call locally");
        builder.call_logger(RecordingCallLogger::new())
    };
    let phone = builder.config(config).build()?;
    let mut events = phone.subscribe();

    phone.initialize().await?;
    let session_id = phone.place_call(number).await?;
    let call = remote
        .last_call()
        .context("loopback adapter did not create a session")?;
    info!(session_id = %session_id, dialled = ?remote.dialled(), "Ringing");

    call.connect();
    tokio::time::sleep(talk_time).await;
    call.remote_hangup();

    let logged = tokio::time::timeout(wait_for_log, next_log_outcome(&mut events, &session_id))
        .await
        .unwrap_or(None);
    phone.shutdown().await;

    match logged {
        Some(record) => Ok(record),
        None => bail!("call {session_id} was not logged"),
    }
}

/// Wait for the completion log of `session_id`, `None` if it was skipped
/// or rejected
async fn next_log_outcome(
    events: &mut broadcast::Receiver<PhoneEvent>,
    session_id: &SessionId,
) -> Option<CallLogRecord> {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Missed phone events");
                continue;
            }
            Err(RecvError::Closed) => return None,
        };
        if event.session_id().is_some_and(|id| id != session_id) {
            debug!(?event, "Event for another call");
            continue;
        }
        match event {
            PhoneEvent::CallLogged { record } => return Some(record),
            PhoneEvent::Notice(notice) => {
                warn!(title = %notice.title, "{}", notice.description);
                if notice.title == "Call Not Logged" {
                    return None;
                }
            }
            PhoneEvent::StateChanged { previous, current, .. } => {
                info!(%previous, %current, "Call state changed");
            }
            PhoneEvent::DurationTick { seconds, .. } => debug!(seconds, "Call duration"),
            other => debug!(?other, "Phone event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::try_parse_from([
            "link-phone",
            "--country-code",
            "44",
            "simulate",
            "--number",
            "07912345678",
            "--talk-secs",
            "3",
            "--client-id",
            "client-42",
        ])
        .unwrap();
        match cli.command {
            Command::Simulate {
                number,
                talk_secs,
                client_id,
                person_id,
            } => {
                assert_eq!(number, "07912345678");
                assert_eq!(talk_secs, 3);
                assert_eq!(client_id.as_deref(), Some("client-42"));
                assert!(person_id.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "link-phone",
            "--api-url",
            "https://practice.example.com/api",
            "--country-code",
            "1",
            "provision",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.api_base_url, "https://practice.example.com/api");
        assert_eq!(config.country_code, "1");
    }

    #[test]
    fn test_normalize_reports_failures() {
        let config = PhoneConfig::default();
        assert!(normalize(&config, &["07912345678".to_string()]).is_ok());
        assert!(normalize(&config, &["not a number".to_string()]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulate_records_call_locally() {
        let association = CallAssociation::new("client-42").with_person("person-7");
        let record = simulate(
            PhoneConfig::default(),
            association,
            "07912 345678",
            Duration::from_secs(5),
            false,
        )
        .await
        .unwrap();

        assert_eq!(record.duration, 5);
        assert_eq!(record.phone_number, "+447912345678");
        assert_eq!(record.client_id, "client-42");
        assert_eq!(record.person_id.as_deref(), Some("person-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulate_without_client_is_not_logged() {
        let err = simulate(
            PhoneConfig::default(),
            CallAssociation::unassociated(),
            "07912345678",
            Duration::from_secs(1),
            false,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("was not logged"));
    }
}
