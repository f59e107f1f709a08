//! The async driver around [`QueueManager`].
//!
//! All scheduler state lives on one task. Connecting to agents, talking to
//! them and sending notifications happen on spawned tasks that report back
//! over a channel, so a slow agent never stalls scanning or other deliveries.

use std::{sync::Arc, time::Duration};

use switchyard_common::{Dsn, Signal, delivery, internal};
use switchyard_tracing::traced;
use tokio::sync::{broadcast, mpsc};

use crate::{
    QmgrError, QueueManager,
    agent::{AgentChannel, AgentConnector, AgentError, AgentReply, DeliveryRequest, DeliveryStatus},
    arena::{MessageId, SessionId, TransportId},
    bounce::FlushStatus,
    manager::{Action, Pace},
};

/// How long to sleep when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// What became of a delivery request.
#[derive(Debug)]
enum Outcome {
    Replied(AgentReply),
    WriteFailed(AgentError),
    Failed(AgentError),
    TimedOut,
}

enum Event {
    Opened {
        transport: TransportId,
        channel: Option<Box<dyn AgentChannel>>,
    },
    Delivered {
        session: SessionId,
        outcome: Outcome,
    },
    Noticed {
        message: MessageId,
        status: FlushStatus,
    },
}

pub struct Scheduler {
    qmgr: QueueManager,
    agents: Arc<dyn AgentConnector>,
    triggers: mpsc::Receiver<Vec<u8>>,
    events: mpsc::UnboundedReceiver<Event>,
    sender: mpsc::UnboundedSender<Event>,
}

impl Scheduler {
    /// `triggers` carries the bytes of each request read from the trigger
    /// socket.
    pub fn new(
        qmgr: QueueManager,
        agents: Arc<dyn AgentConnector>,
        triggers: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        Self {
            qmgr,
            agents,
            triggers,
            events,
            sender,
        }
    }

    #[must_use]
    pub const fn queue_manager(&self) -> &QueueManager {
        &self.qmgr
    }

    /// Run until a shutdown signal arrives or the scheduler fails.
    ///
    /// Files in the active area when this returns are recovered by the next
    /// [`QueueManager::start`].
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn serve(mut self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), QmgrError> {
        self.qmgr.start()?;

        loop {
            self.qmgr.run_timers();
            while self.qmgr.run_once()? == Pace::Busy {
                self.dispatch();
                tokio::task::yield_now().await;
            }
            self.dispatch();

            let wait = self.qmgr.next_timer().map_or(IDLE_WAIT, |due| {
                Duration::from_secs(due.saturating_sub(self.qmgr.now()))
            });

            tokio::select! {
                biased;

                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "queue manager received shutdown signal");
                        }
                        Err(err) => {
                            internal!(level = ERROR, error = %err, "shutdown channel error");
                        }
                    }
                    break;
                }
                Some(event) = self.events.recv() => self.handle(event)?,
                Some(bytes) = self.triggers.recv() => self.qmgr.trigger(&bytes),
                () = tokio::time::sleep(wait) => {}
            }
        }

        let stats = self.qmgr.stats();
        internal!(
            level = INFO,
            messages = stats.messages,
            sessions = stats.sessions,
            "queue manager stopped"
        );
        Ok(())
    }

    /// Start the work the queue manager asked for.
    fn dispatch(&mut self) {
        for action in self.qmgr.take_actions() {
            match action {
                Action::Connect { transport, name } => self.connect(transport, name),
                Action::Notice { message, request } => {
                    let bounce = self.qmgr.bounce.clone();
                    let sender = self.sender.clone();
                    tokio::spawn(async move {
                        let status = bounce.notify(&request).await;
                        let _ = sender.send(Event::Noticed { message, status });
                    });
                }
            }
        }
    }

    fn connect(&self, transport: TransportId, name: String) {
        let agents = self.agents.clone();
        let sender = self.sender.clone();
        let timeout = self.qmgr.config.ipc_timeout;

        tokio::spawn(async move {
            let opened = tokio::time::timeout(timeout, async {
                let mut channel = agents.connect(&name).await?;
                channel.initial_status().await?;
                Ok::<_, AgentError>(channel)
            })
            .await
            .unwrap_or(Err(AgentError::Timeout));

            let channel = match opened {
                Ok(channel) => Some(channel),
                Err(err) => {
                    delivery!(level = WARN, transport = %name, error = %err, "connect to delivery agent failed");
                    None
                }
            };
            let _ = sender.send(Event::Opened { transport, channel });
        });
    }

    fn deliver(&self, session: SessionId, mut channel: Box<dyn AgentChannel>, request: DeliveryRequest) {
        let sender = self.sender.clone();
        let ipc_timeout = self.qmgr.config.ipc_timeout;
        let reply_timeout = self.qmgr.config.daemon_timeout;

        tokio::spawn(async move {
            let sent = tokio::time::timeout(ipc_timeout, channel.send(&request))
                .await
                .unwrap_or(Err(AgentError::Timeout));

            let outcome = match sent {
                Err(err) => Outcome::WriteFailed(err),
                Ok(()) => match tokio::time::timeout(reply_timeout, channel.reply()).await {
                    Ok(Ok(reply)) => Outcome::Replied(reply),
                    Ok(Err(err)) => Outcome::Failed(err),
                    Err(_) => Outcome::TimedOut,
                },
            };
            let _ = sender.send(Event::Delivered { session, outcome });
        });
    }

    fn handle(&mut self, event: Event) -> Result<(), QmgrError> {
        match event {
            Event::Opened { transport, channel } => {
                let ok = channel.is_some();
                if let Some((session, request)) = self.qmgr.session_opened(transport, ok)?
                    && let Some(channel) = channel
                {
                    self.deliver(session, channel, request);
                }
            }
            Event::Delivered { session, outcome } => match outcome {
                Outcome::Replied(reply) => self.qmgr.delivery_reply(session, reply)?,
                Outcome::WriteFailed(err) => {
                    delivery!(level = WARN, %session, error = %err, "cannot send delivery request");
                    self.qmgr.delivery_write_failed(session)?;
                }
                Outcome::Failed(err) => {
                    delivery!(level = WARN, %session, error = %err, "no delivery status from agent");
                    self.qmgr.delivery_reply(
                        session,
                        AgentReply {
                            status: DeliveryStatus::Crash,
                            dsn: Dsn::new("", ""),
                        },
                    )?;
                }
                Outcome::TimedOut => {
                    delivery!(level = WARN, %session, "timed out waiting for delivery status");
                    self.qmgr.delivery_timeout(session)?;
                }
            },
            Event::Noticed { message, status } => self.qmgr.notice_done(message, status)?,
        }
        Ok(())
    }
}
