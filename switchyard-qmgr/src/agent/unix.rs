//! Agents listening on Unix sockets, one socket per transport.
//!
//! The wire format is plain attribute records: `name=value` lines, each
//! record ended by an empty line. A request is one record, then one record
//! per recipient, then an empty record.

use std::path::PathBuf;

use async_trait::async_trait;
use switchyard_common::{Dsn, delivery};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream},
    net::UnixStream,
};

use super::{AgentChannel, AgentConnector, AgentError, AgentReply, DeliveryRequest, DeliveryStatus};

/// Longest line accepted from an agent.
const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct UnixAgentConnector {
    socket_directory: PathBuf,
}

impl UnixAgentConnector {
    #[must_use]
    pub const fn new(socket_directory: PathBuf) -> Self {
        Self { socket_directory }
    }
}

#[async_trait]
impl AgentConnector for UnixAgentConnector {
    async fn connect(&self, transport: &str) -> Result<Box<dyn AgentChannel>, AgentError> {
        let path = self.socket_directory.join(transport);
        delivery!(level = DEBUG, transport, path = %path.display(), "connecting to delivery agent");
        let stream = UnixStream::connect(&path).await?;
        Ok(Box::new(UnixAgentChannel {
            stream: BufStream::new(stream),
        }))
    }
}

type Attributes = Vec<(String, String)>;

#[derive(Debug)]
struct UnixAgentChannel {
    stream: BufStream<UnixStream>,
}

fn clean(value: &str) -> String {
    value.replace(['\n', '\r'], " ")
}

fn find<'a>(record: &'a Attributes, name: &str) -> Option<&'a str> {
    record
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn status_code(record: &Attributes) -> Result<i64, AgentError> {
    let value = find(record, "status").ok_or_else(|| AgentError::Protocol(String::from("missing status")))?;
    value
        .parse()
        .map_err(|_| AgentError::Protocol(format!("bad status {value:?}")))
}

fn encode_request(request: &DeliveryRequest) -> String {
    let mut out = String::with_capacity(512 + 96 * request.recipients.len());
    let mut put = |name: &str, value: &str| {
        out.push_str(name);
        out.push('=');
        out.push_str(&clean(value));
        out.push('\n');
    };

    put("queue_name", request.area.name());
    put("queue_id", &request.queue_id.to_string());
    put("offset", &request.data_offset.to_string());
    put("size", &request.data_size.to_string());
    put("nexthop", &request.nexthop);
    put("encoding", request.encoding.as_deref().unwrap_or_default());
    put("sender", &request.sender);
    put("errors_to", request.errors_to.as_deref().unwrap_or_default());
    put("return_receipt", request.return_receipt.as_deref().unwrap_or_default());
    put(
        "arrival_time",
        &format!("{}.{:06}", request.arrival_secs, request.arrival_micros),
    );
    for (name, value) in &request.client {
        put(name, value);
    }
    out.push('\n');

    for recipient in &request.recipients {
        out.push_str(&format!(
            "offset={}\norig_rcpt={}\nrcpt={}\n\n",
            recipient.offset,
            clean(&recipient.original),
            clean(&recipient.address)
        ));
    }
    out.push('\n');
    out
}

impl UnixAgentChannel {
    /// One record, or `Closed` if the agent hung up before sending any of it.
    async fn read_record(&mut self) -> Result<Attributes, AgentError> {
        let mut record = Attributes::new();
        let mut line = String::new();

        loop {
            line.clear();
            let read = (&mut self.stream)
                .take(MAX_LINE as u64)
                .read_line(&mut line)
                .await?;
            if read == 0 {
                return if record.is_empty() {
                    Err(AgentError::Closed)
                } else {
                    Err(AgentError::Protocol(String::from("truncated record")))
                };
            }
            if !line.ends_with('\n') {
                return Err(AgentError::Protocol(String::from("line too long")));
            }

            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                return Ok(record);
            }
            let Some((name, value)) = line.split_once('=') else {
                return Err(AgentError::Protocol(format!("bad attribute {line:?}")));
            };
            record.push((name.to_string(), value.to_string()));
        }
    }
}

#[async_trait]
impl AgentChannel for UnixAgentChannel {
    async fn initial_status(&mut self) -> Result<(), AgentError> {
        let record = self.read_record().await?;
        match status_code(&record)? {
            0 => Ok(()),
            other => Err(AgentError::Protocol(format!("agent not ready, status {other}"))),
        }
    }

    async fn send(&mut self, request: &DeliveryRequest) -> Result<(), AgentError> {
        self.stream
            .write_all(encode_request(request).as_bytes())
            .await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn reply(&mut self) -> Result<AgentReply, AgentError> {
        let record = self.read_record().await?;
        let status = DeliveryStatus::from_code(status_code(&record)?);
        let dsn = Dsn::new(
            find(&record, "dsn_status").unwrap_or_default(),
            find(&record, "reason").unwrap_or_default(),
        );
        Ok(AgentReply { status, dsn })
    }
}
