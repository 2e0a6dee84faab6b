//! Client crate integration test: event processor lifecycle
//!
//! Processors run their own balancing loop on a short interval; events are
//! published through the in-memory link factory and observed in the handler.

mod common;

use anyhow::Result;
use common::{options, wait_until, Cluster, RecordingHandler, GROUP, HUB};
use std::sync::Arc;
use tributary_client::{
    ClientError, CloseReason, EventProcessor, LoadBalancingStrategy, OwnershipStore,
    ProcessorOptions,
};

fn fast(strategy: LoadBalancingStrategy) -> ProcessorOptions {
    ProcessorOptions {
        load_balancing_interval_ms: 20,
        ..options(strategy)
    }
}

/// **Test:** Builder validation
///
/// **Expectation:** Missing collaborators, an empty owner id and inconsistent options
/// are rejected; without an owner id a random one is generated per instance.
#[tokio::test]
async fn builder_validates_configuration() -> Result<()> {
    let cluster = Cluster::new(1);

    let missing_handler = EventProcessor::builder()
        .with_event_hub(HUB)
        .with_ownership_store(cluster.store.clone())
        .with_partition_source(cluster.source.clone())
        .with_link_factory(cluster.links.clone())
        .build();
    assert!(matches!(missing_handler, Err(ClientError::InvalidOptions(_))));

    let complete = || {
        EventProcessor::builder()
            .with_event_hub(HUB)
            .with_consumer_group(GROUP)
            .with_ownership_store(cluster.store.clone())
            .with_partition_source(cluster.source.clone())
            .with_link_factory(cluster.links.clone())
            .with_event_handler(cluster.handler.clone())
    };

    assert!(matches!(
        complete().with_owner_id("").build(),
        Err(ClientError::InvalidOptions(_))
    ));
    assert!(matches!(
        complete()
            .with_options(ProcessorOptions {
                prefetch_count: 0,
                ..Default::default()
            })
            .build(),
        Err(ClientError::InvalidOptions(_))
    ));

    let first = complete().build()?;
    let second = complete().build()?;
    assert_eq!(first.identifier().len(), 36);
    assert_ne!(first.identifier(), second.identifier());
    Ok(())
}

/// **Test:** Start, consume, stop
///
/// **Reason:** The loop claims every partition, the pumps deliver published events,
/// a second `start` is a no-op and `stop` closes the pumps and releases ownership.
#[tokio::test]
async fn processor_consumes_and_releases_partitions() -> Result<()> {
    let cluster = Cluster::new(2);
    let processor = cluster.instance("instance-a", fast(LoadBalancingStrategy::Greedy));

    processor.start().await;
    processor.start().await;
    assert!(processor.is_running().await);
    wait_until(|| processor.running_partitions().len() == 2).await;

    for body in ["a", "b"] {
        cluster.links.publish("0", body);
        cluster.links.publish("1", body);
    }
    let handler = cluster.handler.clone();
    wait_until(|| handler.event_count() == 4).await;
    assert_eq!(handler.sequence_numbers("0"), vec![0, 1]);
    assert_eq!(handler.sequence_numbers("1"), vec![0, 1]);

    processor.stop().await;
    assert!(!processor.is_running().await);
    assert!(processor.running_partitions().is_empty());
    assert_eq!(
        handler.closed(),
        vec![
            ("0".to_string(), CloseReason::Shutdown),
            ("1".to_string(), CloseReason::Shutdown)
        ]
    );

    let records = cluster.store.list_ownership(HUB, GROUP).await?;
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.owner().is_none()));
    Ok(())
}

/// **Test:** Handover resumes after the last checkpoint
///
/// **Reason:** Instance A checkpoints every event and relinquishes on stop; instance B
/// takes the partition over on its first pass, without waiting for the expiration.
///
/// **Expectation:** B only sees the events published after A's last checkpoint.
#[tokio::test]
async fn handover_resumes_from_checkpoint() -> Result<()> {
    let cluster = Cluster::new(1);
    let first = Arc::new(RecordingHandler::checkpointing());
    let second = Arc::new(RecordingHandler::checkpointing());
    let a = cluster.instance_with_handler("instance-a", fast(LoadBalancingStrategy::Greedy), first.clone());
    let b = cluster.instance_with_handler("instance-b", fast(LoadBalancingStrategy::Greedy), second.clone());

    for body in ["0", "1", "2"] {
        cluster.links.publish("0", body);
    }
    a.start().await;
    wait_until(|| first.event_count() == 3).await;
    a.stop().await;

    b.start().await;
    wait_until(|| b.running_partitions() == vec!["0".to_string()]).await;
    cluster.links.publish("0", "3");
    cluster.links.publish("0", "4");
    wait_until(|| second.event_count() == 2).await;

    assert_eq!(first.sequence_numbers("0"), vec![0, 1, 2]);
    assert_eq!(second.sequence_numbers("0"), vec![3, 4]);
    b.stop().await;
    Ok(())
}

/// **Test:** Two running processors split the partitions
///
/// **Expectation:** A joiner steals from the instance that owns everything until both
/// pump two partitions each.
#[tokio::test]
async fn running_processors_split_partitions() -> Result<()> {
    let cluster = Cluster::new(4);
    let a = cluster.instance("instance-a", fast(LoadBalancingStrategy::Greedy));
    let b = cluster.instance("instance-b", fast(LoadBalancingStrategy::Greedy));

    a.start().await;
    wait_until(|| a.running_partitions().len() == 4).await;

    b.start().await;
    wait_until(|| a.running_partitions().len() == 2 && b.running_partitions().len() == 2).await;

    let mut all = a.running_partitions();
    all.extend(b.running_partitions());
    all.sort();
    assert_eq!(all, vec!["0", "1", "2", "3"]);

    a.stop().await;
    b.stop().await;
    Ok(())
}
