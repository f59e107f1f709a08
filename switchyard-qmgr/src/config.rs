//! Scheduler settings.
//!
//! Every field has a default, so an empty configuration is a working one.
//! Times accept plain seconds or a unit suffix (see
//! [`switchyard_common::duration`]).

use std::{path::PathBuf, time::Duration};

use ahash::AHashMap;
use serde::Deserialize;
use thiserror::Error;

use crate::{agent::AgentConfig, bounce::BounceConfig, feedback::Feedback, resolve::ResolverConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("bad feedback expression {value:?}: {reason}")]
    Feedback { value: String, reason: String },

    #[error("transport {transport}: {reason}")]
    Transport { transport: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}

fn default_queue_directory() -> PathBuf {
    PathBuf::from("/var/spool/switchyard")
}

const fn default_queue_run_delay() -> Duration {
    Duration::from_secs(300)
}

const fn default_min_backoff() -> Duration {
    Duration::from_secs(300)
}

const fn default_max_backoff() -> Duration {
    Duration::from_secs(4000)
}

const fn default_queue_lifetime() -> Duration {
    Duration::from_secs(5 * 24 * 60 * 60)
}

const fn default_active_limit() -> usize {
    20_000
}

const fn default_recipient_limit() -> i64 {
    20_000
}

const fn default_message_recipient_minimum() -> i64 {
    10
}

const fn default_message_recipient_ceiling() -> i64 {
    5000
}

const fn default_fudge_factor() -> i64 {
    100
}

const fn default_transport_retry_time() -> Duration {
    Duration::from_secs(60)
}

fn default_double_bounce_sender() -> String {
    String::from("double-bounce")
}

const fn default_daemon_timeout() -> Duration {
    Duration::from_secs(1000)
}

const fn default_ipc_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_true() -> bool {
    true
}

const fn default_future_tolerance() -> Duration {
    Duration::from_secs(1)
}

const fn default_clog_warn_time() -> Duration {
    Duration::from_secs(300)
}

const fn default_process_limit() -> usize {
    100
}

/// Upstream flow control token settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowConfig {
    /// Zero turns flow control off
    #[serde(default, with = "switchyard_common::duration")]
    pub in_flow_delay: Duration,

    /// Tokens kept available for producers
    #[serde(default = "default_process_limit")]
    pub process_limit: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            in_flow_delay: Duration::ZERO,
            process_limit: default_process_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QmgrConfig {
    #[serde(default = "default_queue_directory")]
    pub queue_directory: PathBuf,

    /// Interval between deferred area scans
    #[serde(default = "default_queue_run_delay", with = "switchyard_common::duration")]
    pub queue_run_delay: Duration,

    #[serde(default = "default_min_backoff", with = "switchyard_common::duration")]
    pub min_backoff: Duration,

    #[serde(default = "default_max_backoff", with = "switchyard_common::duration")]
    pub max_backoff: Duration,

    #[serde(default = "default_queue_lifetime", with = "switchyard_common::duration")]
    pub max_queue_lifetime: Duration,

    /// Lifetime of messages with a null sender
    #[serde(default = "default_queue_lifetime", with = "switchyard_common::duration")]
    pub bounce_queue_lifetime: Duration,

    /// Most messages in core at once
    #[serde(default = "default_active_limit")]
    pub active_limit: usize,

    /// Most recipients in core at once, across all messages
    #[serde(default = "default_recipient_limit")]
    pub recipient_limit: i64,

    #[serde(default = "default_message_recipient_minimum")]
    pub message_recipient_minimum: i64,

    /// Most recipients read from one file per pass
    #[serde(default = "default_message_recipient_ceiling")]
    pub message_recipient_ceiling: i64,

    /// Percentage of `recipient_limit` a fresh message may claim
    #[serde(default = "default_fudge_factor")]
    pub fudge_factor: i64,

    #[serde(default = "default_transport_retry_time", with = "switchyard_common::duration")]
    pub transport_retry_time: Duration,

    /// Transports whose mail waits for an explicit flush
    #[serde(default)]
    pub defer_transports: Vec<String>,

    #[serde(default = "default_double_bounce_sender")]
    pub double_bounce_sender: String,

    /// How long a delivery agent may take to report back
    #[serde(default = "default_daemon_timeout", with = "switchyard_common::duration")]
    pub daemon_timeout: Duration,

    /// Connect and greeting timeout for delivery agents
    #[serde(default = "default_ipc_timeout", with = "switchyard_common::duration")]
    pub ipc_timeout: Duration,

    /// Exit when a delivery agent misses `daemon_timeout`; otherwise the
    /// transport is throttled as if the agent had crashed
    #[serde(default = "default_true")]
    pub watchdog_fatal: bool,

    /// Slack before a file timestamp counts as in the future
    #[serde(default = "default_future_tolerance", with = "switchyard_common::duration")]
    pub future_tolerance: Duration,

    /// Minimum spacing of "destination is falling behind" warnings; zero
    /// disables them
    #[serde(default = "default_clog_warn_time", with = "switchyard_common::duration")]
    pub clog_warn_time: Duration,

    /// Send one bounce per recipient for VERP messages
    #[serde(default = "default_true")]
    pub verp_bounces: bool,

    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub transport_defaults: TransportSettings,

    #[serde(default)]
    pub transports: AHashMap<String, TransportOverride>,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub agents: AgentConfig,

    #[serde(default)]
    pub bounce: BounceConfig,
}

impl Default for QmgrConfig {
    fn default() -> Self {
        Self {
            queue_directory: default_queue_directory(),
            queue_run_delay: default_queue_run_delay(),
            min_backoff: default_min_backoff(),
            max_backoff: default_max_backoff(),
            max_queue_lifetime: default_queue_lifetime(),
            bounce_queue_lifetime: default_queue_lifetime(),
            active_limit: default_active_limit(),
            recipient_limit: default_recipient_limit(),
            message_recipient_minimum: default_message_recipient_minimum(),
            message_recipient_ceiling: default_message_recipient_ceiling(),
            fudge_factor: default_fudge_factor(),
            transport_retry_time: default_transport_retry_time(),
            defer_transports: Vec::new(),
            double_bounce_sender: default_double_bounce_sender(),
            daemon_timeout: default_daemon_timeout(),
            ipc_timeout: default_ipc_timeout(),
            watchdog_fatal: true,
            future_tolerance: default_future_tolerance(),
            clog_warn_time: default_clog_warn_time(),
            verp_bounces: true,
            flow: FlowConfig::default(),
            transport_defaults: TransportSettings::default(),
            transports: AHashMap::default(),
            resolver: ResolverConfig::default(),
            agents: AgentConfig::default(),
            bounce: BounceConfig::default(),
        }
    }
}

impl QmgrConfig {
    /// Effective settings for one transport: defaults plus its overrides.
    #[must_use]
    pub fn transport(&self, name: &str) -> TransportSettings {
        let mut settings = self.transport_defaults.clone();
        if let Some(overrides) = self.transports.get(name) {
            overrides.apply(&mut settings);
        }
        settings.normalise();
        settings
    }

    /// Catch settings that would wedge the scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_backoff > self.max_backoff {
            return Err(ConfigError::Invalid(format!(
                "min_backoff ({}s) exceeds max_backoff ({}s)",
                self.min_backoff.as_secs(),
                self.max_backoff.as_secs()
            )));
        }
        if self.active_limit == 0 || self.recipient_limit <= 0 {
            return Err(ConfigError::Invalid(String::from(
                "active_limit and recipient_limit must be positive",
            )));
        }
        if self.message_recipient_minimum <= 0 || self.message_recipient_ceiling <= 0 {
            return Err(ConfigError::Invalid(String::from(
                "message recipient minimum and ceiling must be positive",
            )));
        }

        for name in self.transports.keys() {
            let settings = self.transport(name);
            if settings.delivery_slot_discount > 100 {
                return Err(ConfigError::Transport {
                    transport: name.clone(),
                    reason: String::from("delivery_slot_discount must be at most 100"),
                });
            }
            if settings.refill_limit == 0 {
                return Err(ConfigError::Transport {
                    transport: name.clone(),
                    reason: String::from("refill_limit must be positive"),
                });
            }
        }

        Ok(())
    }

    pub(crate) fn defers_transport(&self, transport: &str) -> bool {
        self.defer_transports.iter().any(|name| name == transport)
    }
}

const fn default_destination_concurrency_limit() -> u32 {
    20
}

const fn default_initial_destination_concurrency() -> u32 {
    5
}

const fn default_destination_recipient_limit() -> u32 {
    50
}

const fn default_transport_recipient_limit() -> u32 {
    20_000
}

const fn default_extra_recipient_limit() -> u32 {
    1000
}

const fn default_refill_limit() -> u32 {
    100
}

const fn default_refill_delay() -> Duration {
    Duration::from_secs(5)
}

const fn default_delivery_slot_cost() -> u32 {
    5
}

const fn default_delivery_slot_loan() -> u32 {
    3
}

const fn default_delivery_slot_discount() -> u32 {
    50
}

const fn default_minimum_delivery_slots() -> u32 {
    3
}

const fn default_failed_cohort_limit() -> u32 {
    1
}

/// Per-transport scheduling knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSettings {
    /// Zero means no limit
    #[serde(default = "default_destination_concurrency_limit")]
    pub destination_concurrency_limit: u32,

    #[serde(default = "default_initial_destination_concurrency")]
    pub initial_destination_concurrency: u32,

    /// Recipients per delivery request; zero means no limit
    #[serde(default = "default_destination_recipient_limit")]
    pub destination_recipient_limit: u32,

    /// Recipient slots shared by every job of the transport
    #[serde(default = "default_transport_recipient_limit")]
    pub recipient_limit: u32,

    /// Extra slots handed to jobs that preempt another
    #[serde(default = "default_extra_recipient_limit")]
    pub extra_recipient_limit: u32,

    #[serde(default = "default_refill_limit")]
    pub refill_limit: u32,

    #[serde(default = "default_refill_delay", with = "switchyard_common::duration")]
    pub refill_delay: Duration,

    /// Values below two turn preemption off
    #[serde(default = "default_delivery_slot_cost")]
    pub delivery_slot_cost: u32,

    #[serde(default = "default_delivery_slot_loan")]
    pub delivery_slot_loan: u32,

    /// Percentage discount on the slots a preempting job must have earned
    #[serde(default = "default_delivery_slot_discount")]
    pub delivery_slot_discount: u32,

    #[serde(default = "default_minimum_delivery_slots")]
    pub minimum_delivery_slots: u32,

    #[serde(default)]
    pub positive_feedback: Feedback,

    #[serde(default)]
    pub negative_feedback: Feedback,

    /// Failed pseudo-cohorts before a destination is declared dead; zero
    /// never declares it dead
    #[serde(default = "default_failed_cohort_limit")]
    pub failed_cohort_limit: u32,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            destination_concurrency_limit: default_destination_concurrency_limit(),
            initial_destination_concurrency: default_initial_destination_concurrency(),
            destination_recipient_limit: default_destination_recipient_limit(),
            recipient_limit: default_transport_recipient_limit(),
            extra_recipient_limit: default_extra_recipient_limit(),
            refill_limit: default_refill_limit(),
            refill_delay: default_refill_delay(),
            delivery_slot_cost: default_delivery_slot_cost(),
            delivery_slot_loan: default_delivery_slot_loan(),
            delivery_slot_discount: default_delivery_slot_discount(),
            minimum_delivery_slots: default_minimum_delivery_slots(),
            positive_feedback: Feedback::ONE,
            negative_feedback: Feedback::ONE,
            failed_cohort_limit: default_failed_cohort_limit(),
        }
    }
}

impl TransportSettings {
    fn normalise(&mut self) {
        self.initial_destination_concurrency = self.initial_destination_concurrency.max(1);
        if self.destination_concurrency_limit != 0 {
            self.initial_destination_concurrency = self
                .initial_destination_concurrency
                .min(self.destination_concurrency_limit);
        }
        self.refill_limit = self.refill_limit.max(1);
        self.delivery_slot_discount = self.delivery_slot_discount.min(100);
    }

    #[must_use]
    pub const fn slot_loan_factor(&self) -> u32 {
        100 - self.delivery_slot_discount
    }
}

/// Per-transport overrides; unset fields inherit `transport_defaults`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransportOverride {
    pub destination_concurrency_limit: Option<u32>,
    pub initial_destination_concurrency: Option<u32>,
    pub destination_recipient_limit: Option<u32>,
    pub recipient_limit: Option<u32>,
    pub extra_recipient_limit: Option<u32>,
    pub refill_limit: Option<u32>,
    #[serde(default, deserialize_with = "optional_duration")]
    pub refill_delay: Option<Duration>,
    pub delivery_slot_cost: Option<u32>,
    pub delivery_slot_loan: Option<u32>,
    pub delivery_slot_discount: Option<u32>,
    pub minimum_delivery_slots: Option<u32>,
    pub positive_feedback: Option<Feedback>,
    pub negative_feedback: Option<Feedback>,
    pub failed_cohort_limit: Option<u32>,
}

fn optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    switchyard_common::duration::deserialize(deserializer).map(Some)
}

impl TransportOverride {
    fn apply(&self, settings: &mut TransportSettings) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = self.$field {
                        settings.$field = value;
                    }
                )*
            };
        }

        take!(
            destination_concurrency_limit,
            initial_destination_concurrency,
            destination_recipient_limit,
            recipient_limit,
            extra_recipient_limit,
            refill_limit,
            refill_delay,
            delivery_slot_cost,
            delivery_slot_loan,
            delivery_slot_discount,
            minimum_delivery_slots,
            positive_feedback,
            negative_feedback,
            failed_cohort_limit,
        );
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: QmgrConfig = ron::from_str("()").unwrap();
        assert_eq!(config.queue_run_delay, Duration::from_secs(300));
        assert_eq!(config.max_queue_lifetime, Duration::from_secs(432_000));
        assert_eq!(config.active_limit, 20_000);
        assert!(config.watchdog_fatal);
        assert!(config.validate().is_ok());

        let smtp = config.transport("smtp");
        assert_eq!(smtp.destination_concurrency_limit, 20);
        assert_eq!(smtp.initial_destination_concurrency, 5);
        assert_eq!(smtp.slot_loan_factor(), 50);
    }

    #[test]
    fn test_transport_overrides() {
        let config: QmgrConfig = ron::from_str(
            r#"(
                min_backoff: "1m",
                transport_defaults: (delivery_slot_cost: 2),
                transports: {
                    "local": (
                        destination_concurrency_limit: Some(2),
                        destination_recipient_limit: Some(1),
                        refill_delay: Some("10s"),
                        negative_feedback: Some("1/concurrency"),
                    ),
                },
            )"#,
        )
        .unwrap();

        assert_eq!(config.min_backoff, Duration::from_secs(60));

        let local = config.transport("local");
        assert_eq!(local.destination_concurrency_limit, 2);
        // Initial concurrency is clamped to the limit
        assert_eq!(local.initial_destination_concurrency, 2);
        assert_eq!(local.destination_recipient_limit, 1);
        assert_eq!(local.refill_delay, Duration::from_secs(10));
        assert_eq!(local.delivery_slot_cost, 2);
        assert_eq!(local.negative_feedback.to_string(), "1/concurrency");

        let smtp = config.transport("smtp");
        assert_eq!(smtp.destination_recipient_limit, 50);
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = QmgrConfig {
            min_backoff: Duration::from_secs(600),
            max_backoff: Duration::from_secs(60),
            ..QmgrConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
