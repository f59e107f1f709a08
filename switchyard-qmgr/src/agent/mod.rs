//! Talking to delivery agents.
//!
//! A session is one connection: the agent announces itself with an initial
//! status, receives one delivery request, and answers with one reply. The
//! scheduler never sees the framing; [`AgentConnector`] hands it an
//! [`AgentChannel`] for a transport name.

mod builtin;
mod unix;

use std::{fmt::Debug, io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use switchyard_common::Dsn;
use switchyard_spool::{QueueArea, QueueId, QueueStore};
use thiserror::Error;

pub use self::{builtin::BuiltinAgents, unix::UnixAgentConnector};
use crate::{bounce::BounceService, config::QmgrConfig};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Anything that does not parse as the expected record
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    Closed,

    #[error("timed out")]
    Timeout,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    /// Where agent sockets live, one per transport name; defaults to
    /// `private` under the queue directory
    #[serde(default)]
    pub socket_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecipient {
    pub offset: u64,
    pub original: String,
    pub address: String,
}

/// Everything an agent needs to deliver one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub queue_id: QueueId,
    pub area: QueueArea,
    pub data_offset: u64,
    pub data_size: u64,
    pub nexthop: String,
    pub encoding: Option<String>,
    pub sender: String,
    pub errors_to: Option<String>,
    pub return_receipt: Option<String>,
    pub arrival_secs: u64,
    pub arrival_micros: u32,
    pub client: Vec<(String, String)>,
    pub recipients: Vec<RequestRecipient>,
}

/// Outcome class of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Every recipient was delivered, bounced or logged as deferred
    Done,
    /// Some recipient is left for a later attempt
    Defer,
    /// The agent failed outright
    Crash,
}

impl DeliveryStatus {
    /// The wire value; anything unknown is a crash.
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Done,
            1 => Self::Defer,
            _ => Self::Crash,
        }
    }

    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Done => 0,
            Self::Defer => 1,
            Self::Crash => -1,
        }
    }
}

/// The agent's final word on a request. A non-empty DSN status on a deferral
/// blames the destination rather than single recipients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub status: DeliveryStatus,
    pub dsn: Dsn,
}

impl AgentReply {
    #[must_use]
    pub fn done() -> Self {
        Self {
            status: DeliveryStatus::Done,
            dsn: Dsn::new("", ""),
        }
    }

    #[must_use]
    pub fn defer(dsn: Dsn) -> Self {
        Self {
            status: DeliveryStatus::Defer,
            dsn,
        }
    }
}

#[async_trait]
pub trait AgentChannel: Send {
    async fn initial_status(&mut self) -> Result<(), AgentError>;

    async fn send(&mut self, request: &DeliveryRequest) -> Result<(), AgentError>;

    async fn reply(&mut self) -> Result<AgentReply, AgentError>;
}

#[async_trait]
pub trait AgentConnector: Debug + Send + Sync {
    async fn connect(&self, transport: &str) -> Result<Box<dyn AgentChannel>, AgentError>;
}

/// Built-in transports first, then the agent socket of the same name.
#[derive(Debug)]
pub struct AgentRegistry {
    builtin: BuiltinAgents,
    unix: UnixAgentConnector,
}

impl AgentRegistry {
    pub fn new(config: &QmgrConfig, store: QueueStore, bounce: Arc<dyn BounceService>) -> Self {
        let sockets = config
            .agents
            .socket_directory
            .clone()
            .unwrap_or_else(|| config.queue_directory.join("private"));

        Self {
            builtin: BuiltinAgents::new(store, bounce),
            unix: UnixAgentConnector::new(sockets),
        }
    }
}

#[async_trait]
impl AgentConnector for AgentRegistry {
    async fn connect(&self, transport: &str) -> Result<Box<dyn AgentChannel>, AgentError> {
        if BuiltinAgents::serves(transport) {
            self.builtin.connect(transport).await
        } else {
            self.unix.connect(transport).await
        }
    }
}
