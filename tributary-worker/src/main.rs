mod args_parse;
mod service_configuration;

use std::{fs::read_to_string, path::Path, process, sync::Arc};

use crate::{
    args_parse::Args,
    service_configuration::{LoadConfiguration, ServiceConfiguration},
};

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tributary_core::message::{Message, Outcome};
use tributary_dispatch::broker_backend::{InMemoryBroker, InMemoryTransport};
use tributary_dispatch::{
    ConnectionManager, Dispatcher, Publisher, ShutdownCoordinator, TopologyProvisioner,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse command line arguments
    let args = Args::parse()?;

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(Path::new(&args.config_file))
        .context(format!("Failed to read config file {}", args.config_file))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&config_content)?;

    // Attempt to transform LoadConfiguration into ServiceConfiguration
    let mut service_config: ServiceConfiguration = load_config.try_into()?;

    // If `broker_addr` is provided via command-line args, it replaces the address list
    if let Some(broker_addr) = args.broker_addr {
        service_config.connection.addresses = vec![broker_addr];
    }

    // If `member_name` is provided via command-line args, override the value from the config file
    if let Some(member_name) = args.member_name {
        service_config.dispatcher.member_name = member_name;
    }

    // If `queue_group` is provided via command-line args, override the value from the config file
    if let Some(queue_group) = args.queue_group {
        service_config.consumer.queue_group = queue_group;
    }

    // The wire protocol is out of scope here; the worker runs against the
    // in-process broker backend. A deployment against a real broker provides
    // another BrokerTransport implementation.
    let broker = Arc::new(InMemoryBroker::new());
    let transport = Arc::new(InMemoryTransport::new(broker));
    let manager = Arc::new(ConnectionManager::new(
        transport,
        service_config.connection.clone(),
    ));
    manager
        .connect()
        .await
        .context("Unable to establish the initial broker connection")?;

    // Dead-letter topology first, so terminated messages always have a home
    if let Some(dead_letter_stream) = &service_config.dead_letter_stream {
        let provisioner = TopologyProvisioner::new(manager.clone());
        provisioner
            .ensure_stream(dead_letter_stream)
            .await
            .context("Failed to provision the dead-letter stream")?;
    }

    // A deployment registers its repository-backed handler here; the worker
    // ships with one that records what it consumed.
    let handler = Arc::new(|message: Message| async move {
        info!(
            subject = %message.subject,
            sequence = message.sequence,
            attempt = message.attempt,
            size = message.size(),
            "message consumed"
        );
        Outcome::Ack
    });

    let mut dispatcher = Dispatcher::builder()
        .with_connection(manager.clone())
        .with_stream(service_config.stream.clone())
        .with_consumer(service_config.consumer.clone())
        .with_handler(handler)
        .with_options(service_config.dispatcher.clone())
        .build()?;
    dispatcher
        .start()
        .await
        .context("Tributary worker unable to start")?;

    info!(
        stream = %service_config.stream.name,
        queue_group = %service_config.consumer.queue_group,
        member = %service_config.dispatcher.member_name,
        "Tributary worker has started successfully"
    );

    // Optional sample-event loop exercising the publish side against the
    // same stream, the way the original producer deployment did
    let producer_task = service_config.producer.clone().map(|settings| {
        let publisher = Publisher::new(manager.clone(), service_config.publisher.clone());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(settings.interval);
            loop {
                ticker.tick().await;
                match publisher.publish(&settings.subject, &settings.payload).await {
                    Ok(receipt) => {
                        info!(
                            subject = %receipt.subject,
                            sequence = receipt.sequence,
                            "event published"
                        );
                    }
                    Err(e) => warn!(error = %e, "event publish failed"),
                }
            }
        })
    });

    let coordinator = ShutdownCoordinator::new(service_config.step_timeout);
    coordinator.wait_for_signal().await;

    if let Some(task) = producer_task {
        task.abort();
    }
    let exit_code = coordinator.shutdown(&mut dispatcher, &manager).await;
    process::exit(exit_code);
}
