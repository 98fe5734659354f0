//! `wd40` command line.
//!
//! Without a subcommand the binary is the supervisor. The hidden `worker`
//! subcommand is how the supervisor re-executes itself for each worker; its
//! stdin/stdout carry the envelope channel.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use wd40::bus::LibraryConnector;
use wd40::config::{ErrorPolicy, Library, Role, RunConfig};
use wd40::{Console, ProcessLauncher, Supervisor, run_worker, shutdown, telemetry};

#[derive(Parser, Debug)]
#[command(name = "wd40", version, about = "Load generator for publish/subscribe message buses")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs one worker over stdin/stdout (started by the supervisor).
    #[command(hide = true)]
    Worker {
        /// `pub` or `sub`.
        #[arg(long)]
        role: Role,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Broker host
    #[arg(short = 'H', long, env = "WD40_HOST", default_value = "localhost")]
    host: String,

    /// Broker port
    #[arg(short, long, env = "WD40_PORT", default_value_t = 4150)]
    port: u16,

    /// Max in-flight messages per consumer
    #[arg(short, long, env = "WD40_QOS", default_value_t = 1)]
    qos: u32,

    /// Message payload size in bytes
    #[arg(short, long, env = "WD40_MESSAGE_SIZE", default_value_t = 64)]
    message_size: usize,

    /// Messages per publish
    #[arg(short, long, env = "WD40_BATCH_SIZE", default_value_t = 1)]
    batch_size: usize,

    #[arg(short, long, env = "WD40_TOPIC", default_value = "bench#ephemeral")]
    topic: String,

    #[arg(short, long, env = "WD40_CHANNEL", default_value = "wd40#ephemeral")]
    channel: String,

    /// Bus backend for both roles (nsq | null)
    #[arg(short, long, env = "WD40_LIB", default_value = "nsq")]
    lib: Library,

    /// Producer backend; defaults to --lib
    #[arg(short = 'P', long, env = "WD40_PUB_LIB")]
    pub_lib: Option<Library>,

    /// Consumer backend; defaults to --lib
    #[arg(short = 'S', long, env = "WD40_SUB_LIB")]
    sub_lib: Option<Library>,

    #[arg(long, alias = "pub-count", env = "WD40_PUBLISHER_COUNT", default_value_t = 1)]
    publisher_count: usize,

    #[arg(long, alias = "sub-count", env = "WD40_SUBSCRIBER_COUNT", default_value_t = 1)]
    subscriber_count: usize,

    /// Minimum delay between console reports (ms)
    #[arg(short = 'd', long, env = "WD40_MIN_REPORT_DELAY", default_value_t = 1_000)]
    min_report_delay: u64,

    /// Maximum delay before a pending console report (ms)
    #[arg(short = 'D', long, env = "WD40_MAX_REPORT_DELAY", default_value_t = 5_000)]
    max_report_delay: u64,

    /// Minimum delay between worker reports (ms)
    #[arg(long, env = "WD40_WORKER_MIN_REPORT_DELAY", default_value_t = 250)]
    worker_min_report_delay: u64,

    /// Maximum delay before a pending worker report (ms)
    #[arg(long, env = "WD40_WORKER_MAX_REPORT_DELAY", default_value_t = 1_000)]
    worker_max_report_delay: u64,

    #[arg(long, env = "WD40_DEFLATE")]
    deflate: bool,

    #[arg(long, env = "WD40_SNAPPY")]
    snappy: bool,

    /// 0 retries forever
    #[arg(long, env = "WD40_MAX_RECONNECT_ATTEMPTS", default_value_t = 0)]
    max_reconnect_attempts: u32,

    /// Base reconnect backoff (ms)
    #[arg(long, env = "WD40_RECONNECT_DELAY", default_value_t = 100)]
    reconnect_delay: u64,

    /// Reconnect backoff cap (ms)
    #[arg(long, env = "WD40_MAX_RECONNECT_DELAY", default_value_t = 30_000)]
    max_reconnect_delay: u64,

    /// Hold each received message this long before finishing it (ms, 0 = at once)
    #[arg(long, env = "WD40_ACK_DELAY", default_value_t = 0)]
    ack_delay: u64,

    /// Touch held messages at this interval (ms, 0 = never)
    #[arg(long, env = "WD40_REMIND_INTERVAL", default_value_t = 0)]
    remind_interval: u64,

    /// Steady-state bus failures: swallow | halt
    #[arg(long, env = "WD40_ON_ERROR", default_value = "swallow")]
    on_error: ErrorPolicy,
}

impl From<RunArgs> for RunConfig {
    fn from(a: RunArgs) -> Self {
        RunConfig {
            host: a.host,
            port: a.port,
            qos: a.qos,
            message_size: a.message_size,
            batch_size: a.batch_size,
            topic: a.topic,
            channel: a.channel,
            lib: a.lib,
            pub_lib: a.pub_lib,
            sub_lib: a.sub_lib,
            publisher_count: a.publisher_count,
            subscriber_count: a.subscriber_count,
            min_report_delay_ms: a.min_report_delay,
            max_report_delay_ms: a.max_report_delay,
            worker_min_report_delay_ms: a.worker_min_report_delay,
            worker_max_report_delay_ms: a.worker_max_report_delay,
            deflate: a.deflate,
            snappy: a.snappy,
            max_reconnect_attempts: a.max_reconnect_attempts,
            reconnect_delay_ms: a.reconnect_delay,
            max_reconnect_delay_ms: a.max_reconnect_delay,
            ack_delay_ms: a.ack_delay,
            remind_interval_ms: a.remind_interval,
            on_error: a.on_error,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Worker { role }) => {
            if let Err(e) = shutdown::ignore_interrupts() {
                warn!(error = %e, "could not detach from terminal interrupts");
            }
            let connector = Arc::new(LibraryConnector);
            Ok(run_worker(role, tokio::io::stdin(), tokio::io::stdout(), connector).await)
        }
        None => supervise(cli.run.into()).await,
    }
}

async fn supervise(cfg: RunConfig) -> Result<ExitCode> {
    let launcher = ProcessLauncher::current_exe().context("locate the wd40 executable")?;
    let supervisor = Supervisor::new(cfg, Box::new(launcher), Box::new(Console::new()))
        .context("invalid configuration")?;
    let summary = supervisor.run().await.context("run aborted")?;

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
