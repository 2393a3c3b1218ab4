use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::process;
use std::time::Duration;

use tributary_core::topology::{
    ConsumerSpec, RetentionPolicy, StorageKind, StreamSpec, DEFAULT_ACK_WAIT, DEFAULT_MAX_DELIVER,
};
use tributary_dispatch::{
    ConnectionOptions, DispatcherOptions, PublisherOptions, ReconnectPolicy,
};

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LoadConfiguration {
    /// Connection name reported to the broker and in logs
    pub(crate) client_name: String,
    /// Broker connectivity configuration
    pub(crate) broker: BrokerNode,
    /// Stream the worker consumes from, provisioned on start
    pub(crate) stream: StreamNode,
    /// Durable queue-group consumer configuration
    pub(crate) consumer: ConsumerNode,
    /// Publisher retry bounds
    #[serde(default)]
    pub(crate) publisher: Option<PublisherNode>,
    /// Dispatcher instance configuration
    #[serde(default)]
    pub(crate) dispatcher: Option<DispatcherNode>,
    /// Destination for permanently failed messages
    #[serde(default)]
    pub(crate) dead_letter: Option<DeadLetterNode>,
    /// Optional sample-event producer loop
    #[serde(default)]
    pub(crate) producer: Option<ProducerNode>,
    /// Shutdown step bound
    #[serde(default)]
    pub(crate) shutdown: Option<ShutdownNode>,
}

/// validated configuration the worker runs with
#[derive(Debug)]
pub(crate) struct ServiceConfiguration {
    pub(crate) connection: ConnectionOptions,
    pub(crate) stream: StreamSpec,
    pub(crate) consumer: ConsumerSpec,
    pub(crate) publisher: PublisherOptions,
    pub(crate) dispatcher: DispatcherOptions,
    /// Provisioned up front so terminated messages always have a home
    pub(crate) dead_letter_stream: Option<StreamSpec>,
    pub(crate) producer: Option<ProducerSettings>,
    pub(crate) step_timeout: Duration,
}

/// Broker connectivity configuration
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct BrokerNode {
    /// Broker addresses, tried in order
    pub(crate) addresses: Vec<String>,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) reconnect: Option<ReconnectNode>,
}

/// Reconnect backoff configuration
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ReconnectNode {
    pub(crate) initial_delay_ms: Option<u64>,
    pub(crate) multiplier: Option<f64>,
    pub(crate) max_delay_ms: Option<u64>,
    /// If unset, retries forever at the capped interval
    pub(crate) max_attempts: Option<usize>,
}

/// Stream configuration node
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StreamNode {
    pub(crate) name: String,
    pub(crate) subjects: Vec<String>,
    pub(crate) retention: Option<RetentionNode>,
    /// "memory" or "disk"; defaults to disk
    pub(crate) storage: Option<String>,
}

/// Stream retention; at most one bound may be set
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RetentionNode {
    pub(crate) max_bytes: Option<u64>,
    pub(crate) max_age_secs: Option<u64>,
}

/// Durable queue-group consumer configuration
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ConsumerNode {
    pub(crate) durable_name: String,
    pub(crate) queue_group: String,
    pub(crate) max_in_flight: Option<usize>,
    pub(crate) ack_wait_ms: Option<u64>,
    pub(crate) max_deliver: Option<usize>,
    /// Redelivery delay ladder, indexed by delivery attempt
    pub(crate) backoff_ms: Option<Vec<u64>>,
}

/// Publisher retry bounds
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PublisherNode {
    pub(crate) max_retries: Option<usize>,
    pub(crate) base_backoff_ms: Option<u64>,
    pub(crate) max_backoff_ms: Option<u64>,
}

/// Dispatcher instance configuration
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DispatcherNode {
    /// Member name within the queue group; defaults to member-<pid>
    pub(crate) member_name: Option<String>,
    pub(crate) drain_timeout_ms: Option<u64>,
    pub(crate) poll_interval_ms: Option<u64>,
}

/// Destination for permanently failed messages
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DeadLetterNode {
    pub(crate) subject: String,
    /// Stream capturing the dead-letter subject, provisioned on start
    pub(crate) stream: Option<StreamNode>,
}

/// Sample-event producer loop configuration
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ProducerNode {
    pub(crate) subject: String,
    pub(crate) interval_ms: u64,
    pub(crate) payload: Option<String>,
}

/// Shutdown step bound
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ShutdownNode {
    pub(crate) step_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub(crate) struct ProducerSettings {
    pub(crate) subject: String,
    pub(crate) interval: Duration,
    pub(crate) payload: Vec<u8>,
}

fn build_stream_spec(node: StreamNode) -> Result<StreamSpec> {
    let retention = match node.retention {
        Some(RetentionNode {
            max_bytes: Some(_),
            max_age_secs: Some(_),
        }) => anyhow::bail!(
            "stream {}: retention cannot be both size and age bounded",
            node.name
        ),
        Some(RetentionNode {
            max_bytes: Some(max_bytes),
            ..
        }) => RetentionPolicy::SizeBounded { max_bytes },
        Some(RetentionNode {
            max_age_secs: Some(secs),
            ..
        }) => RetentionPolicy::AgeBounded {
            max_age: Duration::from_secs(secs),
        },
        _ => RetentionPolicy::Unbounded,
    };

    let storage = match node.storage.as_deref() {
        None | Some("disk") => StorageKind::Disk,
        Some("memory") => StorageKind::Memory,
        Some(other) => anyhow::bail!("stream {}: unknown storage kind {}", node.name, other),
    };

    let mut spec = StreamSpec::new(node.name, node.subjects);
    spec.retention = retention;
    spec.storage = storage;
    spec.validate()?;
    Ok(spec)
}

/// Implementing the TryFrom trait to transform LoadConfiguration into ServiceConfiguration
impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        if config.broker.addresses.is_empty() {
            anyhow::bail!("broker.addresses must list at least one address");
        }

        let mut connection = ConnectionOptions::new(config.broker.addresses)
            .with_client_name(config.client_name);
        match (config.broker.username, config.broker.password) {
            (Some(username), Some(password)) => {
                connection = connection.with_credentials(username, password);
            }
            (None, None) => {}
            _ => anyhow::bail!("broker credentials need both username and password"),
        }
        if let Some(reconnect) = config.broker.reconnect {
            let defaults = ReconnectPolicy::default();
            connection = connection.with_reconnect(ReconnectPolicy {
                initial_delay: reconnect
                    .initial_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.initial_delay),
                multiplier: reconnect.multiplier.unwrap_or(defaults.multiplier),
                max_delay: reconnect
                    .max_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_delay),
                max_attempts: reconnect.max_attempts,
            });
        }

        let stream = build_stream_spec(config.stream).context("Failed to build stream spec")?;

        let mut consumer = ConsumerSpec::new(
            config.consumer.durable_name,
            config.consumer.queue_group,
            stream.name.clone(),
        );
        if let Some(max_in_flight) = config.consumer.max_in_flight {
            consumer.max_in_flight = max_in_flight;
        }
        consumer.ack_wait = config
            .consumer
            .ack_wait_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_ACK_WAIT);
        consumer.max_deliver = config.consumer.max_deliver.unwrap_or(DEFAULT_MAX_DELIVER);
        consumer.backoff = config
            .consumer
            .backoff_ms
            .unwrap_or_default()
            .into_iter()
            .map(Duration::from_millis)
            .collect();
        consumer
            .validate()
            .context("Failed to build consumer spec")?;

        let publisher = config
            .publisher
            .map(|node| PublisherOptions {
                max_retries: node.max_retries.unwrap_or(0),
                base_backoff_ms: node.base_backoff_ms.unwrap_or(0),
                max_backoff_ms: node.max_backoff_ms.unwrap_or(0),
            })
            .unwrap_or_default();

        let dispatcher_node = config.dispatcher.unwrap_or(DispatcherNode {
            member_name: None,
            drain_timeout_ms: None,
            poll_interval_ms: None,
        });
        let defaults = DispatcherOptions::default();
        let (dead_letter_subject, dead_letter_stream) = match config.dead_letter {
            Some(node) => {
                let stream = node
                    .stream
                    .map(build_stream_spec)
                    .transpose()
                    .context("Failed to build dead-letter stream spec")?;
                (Some(node.subject), stream)
            }
            None => (None, None),
        };
        let dispatcher = DispatcherOptions {
            member_name: dispatcher_node
                .member_name
                .unwrap_or_else(|| format!("member-{}", process::id())),
            dead_letter_subject,
            drain_timeout: dispatcher_node
                .drain_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_timeout),
            poll_interval: dispatcher_node
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        };

        let producer = config.producer.map(|node| ProducerSettings {
            subject: node.subject,
            interval: Duration::from_millis(node.interval_ms),
            payload: node.payload.unwrap_or_else(|| "{}".to_string()).into_bytes(),
        });

        let step_timeout = config
            .shutdown
            .and_then(|node| node.step_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(45));

        Ok(ServiceConfiguration {
            connection,
            stream,
            consumer,
            publisher,
            dispatcher,
            dead_letter_stream,
            producer,
            step_timeout,
        })
    }
}
