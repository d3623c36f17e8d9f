//! `quack` - notification server and console client.

use std::collections::HashSet;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use quack::{
    Config, Credential, Event, EventName, Notification, NotifyServer, TransportKind,
    TransportPreference, TransportSession,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "quack")]
#[command(version = VERSION)]
#[command(about = "Real-time notifications with transport fallback and retry-until-ack")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the notify server; control commands are read as JSON lines on stdin
    Serve {
        /// Listen address
        #[arg(long)]
        bind: Option<String>,
        /// Redelivery interval for unacknowledged notifications
        #[arg(long)]
        resend_interval_ms: Option<u64>,
    },
    /// Connect to a server and print incoming notifications
    Listen {
        /// Notification endpoint (ws://, wss://, http:// or https://)
        #[arg(long)]
        url: Option<String>,
        /// auto, socket, events or polling
        #[arg(long)]
        transport: Option<TransportPreference>,
        /// Identify as this login
        #[arg(long, conflicts_with = "token")]
        login: Option<String>,
        /// Identify with this token
        #[arg(long)]
        token: Option<String>,
        /// Give up after the first failure instead of reconnecting
        #[arg(long)]
        no_reconnect: bool,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(path) = std::env::var("QUACK_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.format_timestamp_millis().init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let mut config = Config::load()?;

    match cli.command {
        Commands::Serve {
            bind,
            resend_interval_ms,
        } => {
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(ms) = resend_interval_ms {
                config.resend_interval_ms = ms;
            }
            serve(&config).await
        }
        Commands::Listen {
            url,
            transport,
            login,
            token,
            no_reconnect,
        } => {
            if url.is_some() {
                config.url = url;
            }
            if let Some(transport) = transport {
                config.transport_kind = transport;
            }
            if login.is_some() {
                config.login = login;
                config.token = None;
            }
            if token.is_some() {
                config.token = token;
            }
            if no_reconnect {
                config.reconnect = false;
            }
            listen(&config).await
        }
        Commands::Config { save } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                let path = config.save()?;
                eprintln!("Saved {}", path.display());
            }
            Ok(())
        }
    }
}

async fn serve(config: &Config) -> Result<()> {
    let server = NotifyServer::new(config.server_options());
    let (listener, addr) = server
        .bind()
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    eprintln!("Listening on ws://{addr}");

    let cancel = CancellationToken::new();
    let accept_loop = {
        let server = server.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { server.serve(listener, cancel).await })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => match line.context("Failed to read stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => println!("{}", server.execute_line(&line)),
                None => {
                    log::debug!("stdin closed, serving until interrupted");
                    stdin_open = false;
                }
            },
        }
    }

    cancel.cancel();
    server.tracker().clear();
    accept_loop.await.context("Accept loop panicked")??;
    Ok(())
}

async fn listen(config: &Config) -> Result<()> {
    let session = TransportSession::builder()
        .options(config.session_options())
        .throttle(config.throttle_options())
        .presenter(print_notification)
        .build();
    let mut events = session.bus().forward(&[
        EventName::Show,
        EventName::Notification,
        EventName::Connect,
        EventName::Disconnect,
    ]);
    session.connect(None).context("Cannot listen")?;

    if let Some(Credential::Login(login) | Credential::Token(login)) = config.credential() {
        log::debug!("Listening as '{}'", login);
    }

    let mut acks = Acknowledger::default();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event @ (Event::Show(_) | Event::Notification(_))) => {
                    let acknowledgeable = session.active_transport() == Some(TransportKind::Socket);
                    if let (Some(id), true) = (acks.id_to_ack(&event), acknowledgeable) {
                        session.acknowledge(&id, Some("shown"));
                    }
                }
                Some(Event::Connect { transport }) => eprintln!("-- connected ({transport})"),
                Some(Event::Disconnect) => eprintln!("-- disconnected"),
                Some(_) => {}
                None => break,
            },
        }
    }

    session.disconnect();
    Ok(())
}

/// Picks the ids the console client acknowledges: every shown id, and any
/// redelivery of an id already shown, since the throttle drops the repeat
/// without a `show`.
#[derive(Debug, Default)]
struct Acknowledger {
    presented: HashSet<String>,
}

impl Acknowledger {
    fn id_to_ack(&mut self, event: &Event) -> Option<String> {
        match event {
            Event::Show(notification) => {
                let id = notification.id.clone()?;
                self.presented.insert(id.clone());
                Some(id)
            }
            Event::Notification(notification) => notification
                .id
                .as_ref()
                .filter(|id| self.presented.contains(id.as_str()))
                .cloned(),
            _ => None,
        }
    }
}

fn print_notification(notification: &Notification) {
    if notification.title.is_empty() {
        println!("{}", notification.body);
    } else {
        println!("[{}] {}", notification.title, notification.body);
    }
    for action in &notification.actions {
        match &action.tag {
            Some(tag) => println!("    ({}) {}", tag, action.label),
            None => println!("    {}", action.label),
        }
    }
}
