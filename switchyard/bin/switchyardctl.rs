//! Command-line utility for poking a running switchyard
//!
//! Every command writes one trigger request to the scheduler's socket:
//! - Flushing the queue (revive dead destinations, retry everything)
//! - Scanning the incoming or deferred area now
//! - Expiring a deferred message so it is returned to its sender

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use switchyard::listener;
use switchyard_qmgr::Trigger;
use switchyard_spool::{QueueArea, QueueId, QueueStore};

/// Command-line utility for managing the switchyard queue
#[derive(Parser, Debug)]
#[command(name = "switchyardctl")]
#[command(about = "Manage the switchyard queue", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the queue directory
    #[arg(short, long, default_value = "/var/spool/switchyard")]
    queue_directory: PathBuf,

    /// Path to the trigger socket, if not `<queue_directory>/public/qmgr`
    #[arg(short = 's', long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Revive dead transports and destinations and retry every message
    Flush,
    /// Look for new mail in the incoming area
    ScanIncoming,
    /// Retry deferred mail whose backoff has passed
    ScanDeferred,
    /// Retry all deferred mail, ignoring backoff
    ScanAll,
    /// Tell the scheduler new mail may have arrived
    Wakeup,
    /// Return a deferred message to its sender on the next deferred scan
    Expire {
        /// Queue id of the message
        queue_id: String,
    },
}

/// The request bytes for a command.
fn request(command: &Commands) -> Vec<u8> {
    let triggers: &[Trigger] = match command {
        Commands::Flush => &[
            Trigger::FlushDead,
            Trigger::ScanAll,
            Trigger::ScanDeferred,
            Trigger::ScanIncoming,
        ],
        Commands::ScanIncoming => &[Trigger::ScanIncoming],
        Commands::ScanDeferred | Commands::Expire { .. } => &[Trigger::ScanDeferred],
        Commands::ScanAll => &[Trigger::ScanAll, Trigger::ScanDeferred, Trigger::ScanIncoming],
        Commands::Wakeup => &[Trigger::Wakeup],
    };
    triggers.iter().map(|trigger| trigger.byte()).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let socket = cli
        .socket
        .clone()
        .unwrap_or_else(|| listener::socket_path(&cli.queue_directory));

    if let Commands::Expire { queue_id } = &cli.command {
        let queue_id: QueueId = queue_id.parse()?;
        QueueStore::new(&cli.queue_directory).request_expire(QueueArea::Deferred, &queue_id)?;
        println!("{queue_id}: marked for expiry");
    }

    listener::send_trigger(&socket, &request(&cli.command))
        .await
        .map_err(|err| anyhow::anyhow!("cannot reach {}: {err}", socket.display()))?;

    Ok(())
}
