use std::{
    path::PathBuf,
    sync::{Arc, LazyLock},
};

use serde::Deserialize;
use switchyard_common::{Signal, internal, logging, tracing};
use switchyard_qmgr::{
    QmgrConfig, QueueManager,
    agent::AgentRegistry,
    bounce::SpoolBounceService,
    resolve::TableResolver,
    scheduler::Scheduler,
};
use switchyard_spool::QueueStore;
use switchyard_tracing::traced;
use tokio::sync::{broadcast, mpsc};

use crate::listener::{self, TriggerListener};

/// Trigger batches waiting for the scheduler.
const TRIGGER_BACKLOG: usize = 64;

/// The daemon, as described by its configuration file.
#[derive(Debug, Default, Deserialize)]
pub struct Switchyard {
    #[serde(alias = "queue_manager", default)]
    qmgr: QmgrConfig,
    /// Defaults to `<queue_directory>/public/qmgr`
    #[serde(default)]
    trigger_socket: Option<PathBuf>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[traced(instrument(level = tracing::Level::TRACE))]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Switchyard {
    #[must_use]
    pub const fn config(&self) -> &QmgrConfig {
        &self.qmgr
    }

    #[must_use]
    pub fn trigger_socket(&self) -> PathBuf {
        self.trigger_socket
            .clone()
            .unwrap_or_else(|| listener::socket_path(&self.qmgr.queue_directory))
    }

    /// Run the scheduler and the trigger socket until shutdown.
    ///
    /// # Errors
    ///
    /// This function will return an error if the configuration is invalid,
    /// the queue directory or trigger socket cannot be set up, or the
    /// scheduler fails.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();
        self.qmgr.validate()?;

        let socket = self.trigger_socket();
        let config = self.qmgr;
        let store = QueueStore::new(&config.queue_directory);
        store.init()?;

        let bounce = Arc::new(SpoolBounceService::new(store.clone(), &config));
        let resolver = Arc::new(TableResolver::new(config.resolver.clone()));
        let agents = Arc::new(AgentRegistry::new(&config, store.clone(), bounce.clone()));
        let qmgr = QueueManager::new(Arc::new(config), store, bounce, resolver);

        let (triggers, trigger_rx) = mpsc::channel(TRIGGER_BACKLOG);
        let listener = TriggerListener::bind(socket).await?;
        let scheduler = Scheduler::new(qmgr, agents, trigger_rx);

        internal!("Controller running");

        let ret = tokio::select! {
            r = scheduler.serve(SHUTDOWN_BROADCAST.subscribe()) => r.map_err(anyhow::Error::from),
            r = listener.serve(triggers, SHUTDOWN_BROADCAST.subscribe()) => r.map_err(anyhow::Error::from),
            r = shutdown() => r,
        };

        internal!("Shutting down...");

        ret
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_config_file_parses() {
        let switchyard: Switchyard = ron::from_str(
            r#"(
                qmgr: (
                    queue_directory: "/var/spool/switchyard",
                    min_backoff: "5m",
                    transports: {
                        "smtp": (destination_concurrency_limit: Some(10)),
                    },
                ),
            )"#,
        )
        .unwrap();

        assert_eq!(switchyard.config().min_backoff, Duration::from_secs(300));
        assert_eq!(
            switchyard.trigger_socket(),
            PathBuf::from("/var/spool/switchyard/public/qmgr")
        );
        assert_eq!(switchyard.config().transport("smtp").destination_concurrency_limit, 10);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let switchyard: Switchyard = ron::from_str("()").unwrap();
        assert_eq!(switchyard.config().queue_directory, QmgrConfig::default().queue_directory);
        assert!(switchyard.config().validate().is_ok());
    }
}
