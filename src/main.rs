use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use njams_sender::config::{self, SenderConfig, TransportKind};
use njams_sender::{Core, OutboundMessage};

#[derive(Parser)]
#[command(name = "njams-sender")]
#[command(version, about = "Deliver monitoring messages over pooled, self-healing connections", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (YAML); NJAMS_* environment variables otherwise
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Send newline-delimited JSON bodies, one message per line
    Send {
        /// Read bodies from this file instead of stdin
        #[arg(short, long)]
        file: Option<String>,

        /// Override the configured endpoint
        #[arg(long)]
        endpoint: Option<String>,

        /// Process path attached to every message
        #[arg(long, default_value = ">njams-sender>")]
        path: String,

        /// Kind of the messages
        #[arg(long, value_enum, default_value_t = Kind::Log)]
        kind: Kind,
    },

    /// Print the effective configuration as YAML
    CheckConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Log,
    Project,
    Trace,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let mut config = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Send {
            file,
            endpoint,
            path,
            kind,
        } => {
            if let Some(endpoint) = endpoint {
                config.endpoint = endpoint;
                config.validate()?;
            }
            cmd_send(config, file.as_deref(), &path, kind).await?;
        }
        Commands::CheckConfig => {
            let yaml = serde_yaml::to_string(&config).context("Failed to render configuration")?;
            print!("{yaml}");
        }
    }

    Ok(())
}

async fn cmd_send(config: SenderConfig, file: Option<&str>, path: &str, kind: Kind) -> Result<()> {
    let input: Box<dyn AsyncRead + Unpin + Send> = match file {
        Some(file) => Box::new(
            tokio::fs::File::open(file)
                .await
                .context(format!("Failed to open input file: {file}"))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    // The channel transport has no backend; its messages are echoed to stdout
    let (core, echo) = match config.transport {
        TransportKind::Tcp => (Core::from_config(config)?, None),
        TransportKind::Channel => {
            let (core, mut rx) = Core::with_channel(config, 64)?;
            let echo = tokio::spawn(async move {
                let mut stdout = tokio::io::stdout();
                while let Some(message) = rx.recv().await {
                    match message.to_wire_line() {
                        Ok(line) => {
                            stdout.write_all(&line).await?;
                            stdout.write_all(b"\n").await?;
                        }
                        Err(e) => tracing::warn!(error = %e, "Unable to render message"),
                    }
                }
                stdout.flush().await
            });
            (core, Some(echo))
        }
    };

    let mut lines = BufReader::new(input).lines();
    let mut line_no = 0usize;
    let mut skipped = 0usize;

    while let Some(line) = lines.next_line().await.context("Failed to read input")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let body: serde_json::Value = match serde_json::from_str(line) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping invalid JSON");
                skipped += 1;
                continue;
            }
        };

        // Admission drops when full; a batch input waits for room instead
        core.dispatcher.wait_for_room().await;

        core.send(build_message(kind, path, line_no, body));
    }

    core.stop().await;
    let stats = core.stats();

    tracing::info!(
        accepted = stats.dispatcher.accepted,
        sent = stats.dispatcher.sent,
        failed = stats.dispatcher.failed,
        dropped = stats.dispatcher.dropped,
        skipped = skipped,
        "Done"
    );

    // Dropping the core releases the last channel sender
    drop(core);
    if let Some(echo) = echo {
        echo.await.context("Echo task failed")?.context("Failed to write to stdout")?;
    }

    if stats.dispatcher.failed + stats.dispatcher.dropped > 0 {
        anyhow::bail!(
            "{} of {} messages were not delivered",
            stats.dispatcher.failed + stats.dispatcher.dropped,
            stats.dispatcher.accepted + stats.dispatcher.dropped
        );
    }

    Ok(())
}

fn build_message(kind: Kind, path: &str, line_no: usize, body: serde_json::Value) -> OutboundMessage {
    match kind {
        Kind::Log => {
            let log_id = body
                .get("logId")
                .and_then(|id| id.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}-{}", chrono::Utc::now().timestamp_millis(), line_no));
            OutboundMessage::log(path, log_id, body)
        }
        Kind::Project => OutboundMessage::project(path, body),
        Kind::Trace => OutboundMessage::trace(path, body),
    }
}
