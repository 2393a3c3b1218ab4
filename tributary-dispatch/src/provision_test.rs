//! Test: idempotent topology provisioning
//!
//! Purpose
//! - ensure_stream/ensure_consumer succeed on repeat calls with an
//!   identical spec and report a conflict on a differing one.
//! - Concurrently racing instances converge on a single creation.

use super::*;
use crate::broker_backend::{InMemoryBroker, InMemoryTransport};
use crate::connection::ConnectionOptions;

use tributary_core::broker::BrokerError;
use tributary_core::topology::{ConsumerSpec, StreamSpec};

fn setup() -> (Arc<InMemoryBroker>, Arc<ConnectionManager>) {
    let broker = Arc::new(InMemoryBroker::new());
    let transport = Arc::new(InMemoryTransport::new(broker.clone()));
    let manager = Arc::new(ConnectionManager::new(
        transport,
        ConnectionOptions::new(vec!["memory://local".to_string()]),
    ));
    (broker, manager)
}

fn orders_stream() -> StreamSpec {
    StreamSpec::new("orders", vec!["orders.*".to_string()])
}

#[tokio::test]
async fn ensure_stream_is_idempotent() {
    let (_broker, manager) = setup();
    let provisioner = TopologyProvisioner::new(manager);

    let first = provisioner.ensure_stream(&orders_stream()).await.unwrap();
    assert_eq!(first, EnsureOutcome::Created);

    let second = provisioner.ensure_stream(&orders_stream()).await.unwrap();
    assert_eq!(second, EnsureOutcome::AlreadyExists);
}

#[tokio::test]
async fn differing_subject_set_is_a_conflict() {
    let (_broker, manager) = setup();
    let provisioner = TopologyProvisioner::new(manager);
    provisioner.ensure_stream(&orders_stream()).await.unwrap();

    let mut differing = orders_stream();
    differing.subjects = vec!["orders.*".to_string(), "invoices.*".to_string()];
    let err = provisioner.ensure_stream(&differing).await.unwrap_err();
    assert!(matches!(err, DispatchError::TopologyConflict(_)));
}

#[tokio::test]
async fn ensure_consumer_is_idempotent_and_detects_conflicts() {
    let (_broker, manager) = setup();
    let provisioner = TopologyProvisioner::new(manager);
    provisioner.ensure_stream(&orders_stream()).await.unwrap();

    let spec = ConsumerSpec::new("workers", "workers", "orders");
    assert_eq!(
        provisioner.ensure_consumer(&spec).await.unwrap(),
        EnsureOutcome::Created
    );
    assert_eq!(
        provisioner.ensure_consumer(&spec).await.unwrap(),
        EnsureOutcome::AlreadyExists
    );

    let mut differing = spec.clone();
    differing.max_in_flight = 16;
    let err = provisioner.ensure_consumer(&differing).await.unwrap_err();
    assert!(matches!(err, DispatchError::TopologyConflict(_)));
}

#[tokio::test]
async fn consumer_requires_an_existing_stream() {
    let (_broker, manager) = setup();
    let provisioner = TopologyProvisioner::new(manager);

    let spec = ConsumerSpec::new("workers", "workers", "missing");
    let err = provisioner.ensure_consumer(&spec).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Broker(BrokerError::NotFound(_))
    ));
}

#[tokio::test]
async fn racing_instances_converge_on_one_creation() {
    let (broker, _manager) = setup();

    // each racing instance owns its own manager, as separate processes would
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let transport = Arc::new(InMemoryTransport::new(broker.clone()));
        let manager = Arc::new(ConnectionManager::new(
            transport,
            ConnectionOptions::new(vec!["memory://local".to_string()]),
        ));
        tasks.push(tokio::spawn(async move {
            let provisioner = TopologyProvisioner::new(manager);
            provisioner.ensure_stream(&orders_stream()).await
        }));
    }

    let mut created = 0;
    let mut already = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            EnsureOutcome::Created => created += 1,
            EnsureOutcome::AlreadyExists => already += 1,
        }
    }
    assert_eq!(created, 1);
    assert_eq!(already, 7);
}
