mod audio;
mod error;
mod io;
mod session;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use audio::{AudioFormat, FrameSource, OpusDecoder};
use io::{OutputKind, WsConnector, WsListener, open_sink};
use session::config::{DEFAULT_CONNECT_ADDR, DEFAULT_LISTEN_ADDR, ws_url};
use session::{BackoffPolicy, Receiver, ReceiverConfig, SenderConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream Opus audio over WebSocket", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve an audio file to receivers, paced in real time
    Send(SendArgs),
    /// Connect to a sender and play the stream
    Receive(ReceiveArgs),
}

#[derive(Args, Debug, Clone, Copy)]
struct FormatArgs {
    /// Stream sample rate in Hz
    #[arg(long, env = "OPUS_RELAY_SAMPLE_RATE", default_value_t = 16000)]
    sample_rate: u32,

    /// Channel count (only mono is supported)
    #[arg(long, env = "OPUS_RELAY_CHANNELS", default_value_t = 1)]
    channels: u16,

    /// Frame duration in milliseconds
    #[arg(long = "frame-ms", env = "OPUS_RELAY_FRAME_MS", default_value_t = 60)]
    frame_ms: u32,
}

impl From<FormatArgs> for AudioFormat {
    fn from(args: FormatArgs) -> Self {
        AudioFormat {
            sample_rate: args.sample_rate,
            channels: args.channels,
            frame_duration_ms: args.frame_ms,
        }
    }
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Audio file to stream (wav, mp3, flac, ogg, aac, alac)
    file: PathBuf,

    /// Address to accept receivers on
    #[arg(long, env = "OPUS_RELAY_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    listen: SocketAddr,

    /// Exit after the first session
    #[arg(long, env = "OPUS_RELAY_ONCE")]
    once: bool,

    #[command(flatten)]
    format: FormatArgs,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default)]
enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Args, Debug)]
struct ReceiveArgs {
    /// Sender address, as host:port or ws://host:port
    #[arg(long, env = "OPUS_RELAY_CONNECT", default_value = DEFAULT_CONNECT_ADDR)]
    connect: String,

    /// Where decoded audio goes
    #[arg(long, env = "OPUS_RELAY_OUTPUT", value_enum, default_value_t = OutputKind::Default)]
    output: OutputKind,

    /// Jitter buffer depth in frames
    #[arg(long, env = "OPUS_RELAY_MAX_BUFFER", default_value_t = 10)]
    max_buffer: usize,

    /// Failed attempts in a row before giving up
    #[arg(long, env = "OPUS_RELAY_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Longest a single connection attempt may take
    #[arg(long, env = "OPUS_RELAY_CONNECT_TIMEOUT_MS", default_value_t = 10000)]
    connect_timeout_ms: u64,

    /// Longest silence on the connection before reconnecting
    #[arg(long, env = "OPUS_RELAY_RECEIVE_TIMEOUT_MS", default_value_t = 5000)]
    receive_timeout_ms: u64,

    /// Delay before reconnecting (base delay for exponential backoff)
    #[arg(long, env = "OPUS_RELAY_BACKOFF_MS", default_value_t = 3000)]
    backoff_ms: u64,

    #[arg(long, env = "OPUS_RELAY_BACKOFF", value_enum, default_value_t = BackoffKind::Fixed)]
    backoff: BackoffKind,

    /// Upper bound for exponential backoff
    #[arg(long, env = "OPUS_RELAY_MAX_BACKOFF_MS", default_value_t = 30000)]
    max_backoff_ms: u64,

    /// How long to wait for buffered audio to play out at the end (0 waits forever)
    #[arg(long, env = "OPUS_RELAY_DRAIN_TIMEOUT_MS", default_value_t = 10000)]
    drain_timeout_ms: u64,

    #[command(flatten)]
    format: FormatArgs,
}

impl ReceiveArgs {
    fn into_config(self) -> Result<(ReceiverConfig, OutputKind)> {
        let backoff = match self.backoff {
            BackoffKind::Fixed => BackoffPolicy::Fixed(Duration::from_millis(self.backoff_ms)),
            BackoffKind::Exponential => BackoffPolicy::Exponential {
                base: Duration::from_millis(self.backoff_ms),
                max: Duration::from_millis(self.max_backoff_ms),
            },
        };
        let drain_timeout =
            (self.drain_timeout_ms > 0).then(|| Duration::from_millis(self.drain_timeout_ms));

        let config = ReceiverConfig {
            format: self.format.into(),
            address: ws_url(&self.connect)?,
            max_buffer_frames: self.max_buffer,
            max_retries: self.max_retries,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            backoff,
            drain_timeout,
            ..Default::default()
        };
        config.validate().context("Invalid receiver configuration")?;
        Ok((config, self.output))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Send(args) => run_sender(args, cancel).await,
        Command::Receive(args) => run_receiver(args, cancel).await,
    }
}

async fn run_sender(args: SendArgs, cancel: CancellationToken) -> Result<()> {
    let config = SenderConfig {
        format: args.format.into(),
        listen: args.listen,
        once: args.once,
    };
    config.validate().context("Invalid sender configuration")?;

    let file = args.file.clone();
    let sample_rate = config.format.sample_rate;
    let pcm = tokio::task::spawn_blocking(move || audio::file::load_pcm(&file, sample_rate))
        .await
        .context("File loader panicked")??;
    if pcm.is_empty() {
        warn!("{} contains no audio", args.file.display());
    }
    let source = FrameSource::new(pcm, config.format.samples_per_frame());

    let listener = WsListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;
    session::serve(listener, source, &config, cancel).await
}

async fn run_receiver(args: ReceiveArgs, cancel: CancellationToken) -> Result<()> {
    let (config, output) = args.into_config()?;
    info!(
        "Receiving from {} ({}Hz, {}ms frames, buffer {} frames)",
        config.address,
        config.format.sample_rate,
        config.format.frame_duration_ms,
        config.max_buffer_frames
    );

    let decoder = OpusDecoder::new(&config.format).context("Failed to create decoder")?;
    let connector = WsConnector::new(config.address.clone());
    let format = config.format;

    let report = Receiver::new(connector, decoder, config)
        .run(move || open_sink(output, &format), cancel)
        .await?;

    if report.gave_up() {
        anyhow::bail!("Giving up: sender unreachable after retries were exhausted");
    }
    Ok(())
}
