//! The `error` and `retry` transports, handled without a separate process.
//!
//! Both read their DSN from the nexthop. `error` bounces when that status is
//! permanent; everything else is logged as deferred.

use std::sync::Arc;

use async_trait::async_trait;
use switchyard_common::{Dsn, delivery};
use switchyard_spool::{LogEntry, QueueStore, mark_done};

use super::{AgentChannel, AgentError, AgentReply, DeliveryRequest};
use crate::bounce::BounceService;

const ERROR: &str = "error";
const RETRY: &str = "retry";

#[derive(Debug, Clone)]
pub struct BuiltinAgents {
    store: QueueStore,
    bounce: Arc<dyn BounceService>,
}

impl BuiltinAgents {
    pub fn new(store: QueueStore, bounce: Arc<dyn BounceService>) -> Self {
        Self { store, bounce }
    }

    #[must_use]
    pub fn serves(transport: &str) -> bool {
        transport == ERROR || transport == RETRY
    }

    pub async fn connect(&self, transport: &str) -> Result<Box<dyn AgentChannel>, AgentError> {
        if !Self::serves(transport) {
            return Err(AgentError::Protocol(format!("no built-in transport {transport:?}")));
        }
        Ok(Box::new(BuiltinChannel {
            bounce_permanent: transport == ERROR,
            agents: self.clone(),
            request: None,
        }))
    }
}

#[derive(Debug)]
struct BuiltinChannel {
    bounce_permanent: bool,
    agents: BuiltinAgents,
    request: Option<DeliveryRequest>,
}

impl BuiltinChannel {
    fn default_status(&self) -> &'static str {
        if self.bounce_permanent { "5.0.0" } else { "4.0.0" }
    }

    /// Whether the recipient's status was logged, either bounced and marked
    /// done or deferred.
    fn handle(&self, request: &DeliveryRequest, entry: &LogEntry) -> bool {
        let agents = &self.agents;
        let outcome = if self.bounce_permanent && entry.dsn.is_permanent() {
            agents
                .bounce
                .bounce_append(&request.queue_id, entry)
                .and_then(|()| {
                    mark_done(
                        agents.store.path(request.area, &request.queue_id),
                        entry.offset,
                    )
                })
        } else {
            agents.bounce.defer_append(&request.queue_id, entry)
        };

        match outcome {
            Ok(()) => {
                delivery!(
                    level = INFO,
                    queue_id = %request.queue_id,
                    to = %entry.recipient,
                    dsn = %entry.dsn,
                    "built-in delivery"
                );
                true
            }
            Err(err) => {
                delivery!(
                    level = WARN,
                    queue_id = %request.queue_id,
                    to = %entry.recipient,
                    error = %err,
                    "unable to log recipient status"
                );
                false
            }
        }
    }
}

#[async_trait]
impl AgentChannel for BuiltinChannel {
    async fn initial_status(&mut self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn send(&mut self, request: &DeliveryRequest) -> Result<(), AgentError> {
        self.request = Some(request.clone());
        Ok(())
    }

    async fn reply(&mut self) -> Result<AgentReply, AgentError> {
        let request = self
            .request
            .take()
            .ok_or_else(|| AgentError::Protocol(String::from("reply before request")))?;
        let dsn = Dsn::parse(&request.nexthop, self.default_status());

        let mut handled = 0;
        for recipient in &request.recipients {
            let entry = LogEntry {
                offset: recipient.offset,
                original: recipient.original.clone(),
                recipient: recipient.address.clone(),
                dsn: dsn.clone(),
            };
            if self.handle(&request, &entry) {
                handled += 1;
            }
        }

        // Only recipients that were bounced and marked done are finished.
        // Deferred ones keep the message queued; the nexthop itself is fine.
        let bounced = self.bounce_permanent && dsn.is_permanent();
        if bounced && handled == request.recipients.len() {
            Ok(AgentReply::done())
        } else {
            Ok(AgentReply::defer(Dsn::new("", "")))
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use switchyard_spool::{EnvelopeReader, EnvelopeWriter, QueueArea, QueueId, Record};

    use super::*;
    use crate::{
        agent::{DeliveryStatus, RequestRecipient},
        bounce::{BounceEvent, RecordingBounceService},
    };

    fn request(queue_id: QueueId, nexthop: &str, offset: u64) -> DeliveryRequest {
        DeliveryRequest {
            queue_id,
            area: QueueArea::Active,
            data_offset: 0,
            data_size: 0,
            nexthop: nexthop.to_string(),
            encoding: None,
            sender: String::from("sender@example.net"),
            errors_to: None,
            return_receipt: None,
            arrival_secs: 0,
            arrival_micros: 0,
            client: Vec::new(),
            recipients: vec![RequestRecipient {
                offset,
                original: String::from("user@gone.example"),
                address: String::from("user@gone.example"),
            }],
        }
    }

    fn recipient_offset(store: &QueueStore, queue_id: &QueueId) -> u64 {
        let mut reader = EnvelopeReader::open(store.path(QueueArea::Active, queue_id)).unwrap();
        while let Some((offset, record)) = reader.next_record().unwrap() {
            match record {
                Record::Recipient(_) => return offset,
                Record::Content { length } => reader.skip(length).unwrap(),
                _ => {}
            }
        }
        panic!("no recipient record");
    }

    #[tokio::test]
    async fn test_error_transport_bounces_permanent_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        store.init().unwrap();
        let queue_id = EnvelopeWriter::new()
            .arrival(1, 0)
            .sender("sender@example.net")
            .recipient("user@gone.example")
            .content(b"Subject: hi\r\n\r\nbody\r\n")
            .commit(&store, QueueArea::Active)
            .unwrap();
        let offset = recipient_offset(&store, &queue_id);

        let bounce = RecordingBounceService::new(None);
        let agents = BuiltinAgents::new(store.clone(), bounce.clone());
        let mut channel = agents.connect("error").await.unwrap();
        channel.initial_status().await.unwrap();
        channel
            .send(&request(queue_id, "5.1.2 domain no longer accepts mail", offset))
            .await
            .unwrap();

        assert_eq!(channel.reply().await.unwrap().status, DeliveryStatus::Done);
        assert!(matches!(
            bounce.events().as_slice(),
            [BounceEvent::Bounced(id, entry)] if *id == queue_id && entry.dsn.status == "5.1.2"
        ));

        let mut reader = EnvelopeReader::open(store.path(QueueArea::Active, &queue_id)).unwrap();
        reader.seek(offset).unwrap();
        assert!(matches!(reader.next_record().unwrap(), Some((_, Record::Done(_)))));
    }

    #[tokio::test]
    async fn test_retry_transport_defers() {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::new(dir.path());
        let bounce = RecordingBounceService::new(None);
        let agents = BuiltinAgents::new(store, bounce.clone());

        let mut channel = agents.connect("retry").await.unwrap();
        channel
            .send(&request(QueueId::generate(), "4.3.2 deferred transport", 0))
            .await
            .unwrap();

        assert_eq!(
            channel.reply().await.unwrap(),
            AgentReply::defer(Dsn::new("", ""))
        );
        let deferred = bounce.deferred();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].dsn, Dsn::new("4.3.2", "deferred transport"));
    }
}
