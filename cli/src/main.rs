use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use frames::{EventKind, LiveEvent};
use voxline::{ClientConfig, LiveClient, LiveError, LiveOptions, OPT_KEEPALIVE, StartParams};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("live client error: {0}")]
    Live(#[from] LiveError),
    #[error("failed to read input {path}: {source}")]
    Input {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("session did not start; check the URL and credentials")]
    StartRefused,
    #[error("failed waiting for interrupt: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "voxline-cli", about = "Voxline live transcription CLI")]
struct Cli {
    #[arg(long, env = "VOXLINE_URL", default_value = "http://127.0.0.1:3000")]
    url: String,

    #[arg(long, env = "VOXLINE_API_KEY", default_value = "")]
    api_key: String,

    /// Enable the periodic keepalive loop.
    #[arg(long, default_value_t = false)]
    keepalive: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a live session and print events until interrupted.
    Listen(ListenArgs),
}

#[derive(Args, Debug)]
struct ListenArgs {
    /// Audio file streamed as binary chunks; without it the session idles
    /// until ctrl-c.
    #[arg(long)]
    input: Option<PathBuf>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    language: Option<String>,

    /// Bytes per outbound audio chunk.
    #[arg(long, default_value_t = 8192)]
    chunk_bytes: usize,

    /// Pause between chunks in milliseconds.
    #[arg(long, default_value_t = 50)]
    chunk_pause_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let Cli {
        url,
        api_key,
        keepalive,
        command,
    } = Cli::parse();

    match command {
        Command::Listen(args) => run_listen(url, api_key, keepalive, args).await,
    }
}

async fn run_listen(
    url: String,
    api_key: String,
    keepalive: bool,
    args: ListenArgs,
) -> Result<(), CliError> {
    let mut config = ClientConfig::new(url, api_key);
    if keepalive {
        config = config.with_option(OPT_KEEPALIVE, "true");
    }
    let mut client = LiveClient::new(config)?;

    client.on(EventKind::Transcript, |event, _context| {
        let LiveEvent::Transcript(transcript) = event else {
            return;
        };
        if let Some(text) = transcript.transcript() {
            if !text.is_empty() {
                if transcript.is_final {
                    println!("{text}");
                } else {
                    println!("(interim) {text}");
                }
            }
        }
    });
    client.on(EventKind::Metadata, |event, _context| {
        if let LiveEvent::Metadata(metadata) = event {
            tracing::info!(request_id = %metadata.request_id, "session metadata");
        }
    });
    client.on(EventKind::UtteranceEnd, |event, _context| {
        if let LiveEvent::UtteranceEnd(utterance) = event {
            tracing::debug!(last_word_end = utterance.last_word_end, "utterance end");
        }
    });
    client.on(EventKind::Error, |event, _context| {
        if let LiveEvent::Error(error) = event {
            tracing::error!(variant = %error.variant, message = %error.message, "session error");
        }
    });
    client.on(EventKind::Close, |_event, _context| {
        tracing::info!("session closed");
    });

    let options = LiveOptions {
        model: args.model.clone(),
        language: args.language.clone(),
        ..LiveOptions::default()
    };

    if !client.start(StartParams::new().with_options(options)).await? {
        return Err(CliError::StartRefused);
    }

    if let Some(path) = &args.input {
        stream_file(&client, path, args.chunk_bytes, args.chunk_pause_ms).await?;
        let _ = client.finalize().await?;
        // Leave the session open briefly so flushed results arrive.
        tokio::time::sleep(Duration::from_secs(2)).await;
        let _ = client.finish().await;
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, closing session");
    let _ = client.finish().await;
    Ok(())
}

/// Stream a local audio file as paced binary chunks.
async fn stream_file(
    client: &LiveClient,
    path: &Path,
    chunk_bytes: usize,
    chunk_pause_ms: u64,
) -> Result<(), CliError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| CliError::Input {
            path: path.to_path_buf(),
            source,
        })?;

    tracing::info!(bytes = bytes.len(), "streaming input file");
    for chunk in bytes.chunks(chunk_bytes.max(1)) {
        if !client.send(chunk).await? {
            tracing::warn!("send refused, stopping stream");
            break;
        }
        tokio::time::sleep(Duration::from_millis(chunk_pause_ms)).await;
    }
    Ok(())
}
