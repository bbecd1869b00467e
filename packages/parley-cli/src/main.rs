//! Parley operator tool
//!
//! 1. **replay**: feed a newline-delimited log of protocol events through a
//!    session and print every application event as one JSON line.
//!
//! 2. **list**: dump the records of one collection.
//!
//! 3. **creds**: load (or create) the session credentials and print a
//!    summary without secret material.
//!
//! Logs go to stderr so stdout stays machine-readable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::WrapErr;
use parley_core::auth::AuthState;
use parley_core::events::EventName;
use parley_core::storage::open_store;
use parley_core::{Citation, LimiterConfig, ProtocolEvent, Session, SessionConfig, StoreBackend};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Parley session tool")]
struct Args {
    /// Parent directory of session folders
    #[arg(long, default_value = "sessions", env = "PARLEY_DATA_DIR")]
    data_dir: PathBuf,

    /// Session name
    #[arg(short, long, default_value = "main", env = "PARLEY_SESSION")]
    session: String,

    /// Storage backend
    #[arg(long, value_enum, default_value_t = Backend::File, env = "PARLEY_BACKEND")]
    backend: Backend,

    /// Database file for the sqlite backend
    #[arg(long, env = "PARLEY_SQLITE_PATH")]
    sqlite_path: Option<PathBuf>,

    /// Command prefix stripped from message text
    #[arg(long, env = "PARLEY_PREFIX")]
    prefix: Option<String>,

    /// Keep self-authored messages
    #[arg(long, env = "PARLEY_KEEP_OWN")]
    keep_own: bool,

    /// Messages per room per window before flagging spam (0 disables)
    #[arg(long, default_value_t = 20, env = "PARLEY_RATE_LIMIT")]
    rate_limit: u32,

    /// Rate-limit window in seconds
    #[arg(long, default_value_t = 10, env = "PARLEY_RATE_WINDOW_SECS")]
    rate_window_secs: u64,

    /// Numeric ids flagged `isOwner` (comma-separated)
    #[arg(long, env = "PARLEY_OWNERS", value_delimiter = ',')]
    owners: Vec<u64>,

    /// Emit logs as JSON
    #[arg(long, env = "PARLEY_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a newline-delimited protocol event log ("-" for stdin)
    Replay { file: PathBuf },
    /// Print the records of a collection
    List { collection: String },
    /// Print a credential summary
    Creds,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Backend {
    File,
    Sqlite,
    Memory,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let backend = match self.backend {
            Backend::File => StoreBackend::File,
            Backend::Sqlite => StoreBackend::Sqlite {
                path: self
                    .sqlite_path
                    .clone()
                    .unwrap_or_else(|| self.data_dir.join("parley.db")),
            },
            Backend::Memory => StoreBackend::Memory,
        };

        let mut citations = Vec::new();
        if !self.owners.is_empty() {
            let owners = self.owners.clone();
            citations.push(Citation::new("owner", move || owners.clone()));
        }

        SessionConfig {
            session: self.session.clone(),
            data_dir: self.data_dir.clone(),
            backend,
            ignore_me: !self.keep_own,
            prefix: self.prefix.clone(),
            limiter: LimiterConfig {
                max_messages: self.rate_limit,
                window: Duration::from_secs(self.rate_window_secs),
            },
            citations,
            ..SessionConfig::default()
        }
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = args.session_config();
    config.validate().wrap_err("invalid configuration")?;

    match &args.command {
        Command::Replay { file } => replay(config, file).await,
        Command::List { collection } => list(config, collection).await,
        Command::Creds => creds(config).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "parley=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

async fn replay(config: SessionConfig, file: &Path) -> color_eyre::Result<()> {
    let session = Session::open(config).await?;
    for name in [EventName::Connection, EventName::Messages, EventName::Calls, EventName::Webhook] {
        session.on(name, |event| match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::error!(error = %e, "Unserializable event"),
        });
    }

    let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> = if file.as_os_str() == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(file)
                .await
                .wrap_err_with(|| format!("opening {}", file.display()))?,
        )
    };

    let mut lines = BufReader::new(reader).lines();
    let mut line_no = 0usize;
    let mut handled = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: ProtocolEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping unparseable event");
                continue;
            }
        };
        session.handle(event).await?;
        handled += 1;
    }

    tracing::info!(events = handled, lines = line_no, "Replay finished");
    session.shutdown().await?;
    Ok(())
}

async fn list(config: SessionConfig, collection: &str) -> color_eyre::Result<()> {
    let store = open_store(&config)?;
    let records = store.list(collection).await?;
    for record in &records {
        println!("{}", serde_json::to_string(record)?);
    }
    tracing::info!(collection, count = records.len(), "Listed records");
    Ok(())
}

async fn creds(config: SessionConfig) -> color_eyre::Result<()> {
    let store = open_store(&config)?;
    let auth = AuthState::load(store, config.retry, config.creds_debounce).await?;
    let creds = auth.creds();

    let summary = json!({
        "session": config.session,
        "registrationId": creds.registration_id,
        "registered": creds.registered,
        "me": creds.own_id(),
        "lid": creds.own_lid(),
        "nextPreKeyId": creds.next_pre_key_id,
        "signedPreKeyId": creds.signed_pre_key.key_id,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    auth.shutdown().await?;
    Ok(())
}
