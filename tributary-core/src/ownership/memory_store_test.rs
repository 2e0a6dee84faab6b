//! Unit tests for the in-memory ownership store
//!
//! These tests pin down the optimistic-concurrency contract the load balancer relies on.

use super::*;
use crate::clock::ManualClock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn claim(partition_id: &str, owner: &str, etag: Option<String>) -> PartitionOwnership {
    PartitionOwnership::new("hub", "$default", partition_id)
        .with_owner(owner)
        .with_etag(etag)
}

/// **Test:** First claim creates the record
///
/// **Reason:** Ownership records are created on the first successful claim.
///
/// **Expectation:** A claim without etag on a vacant partition is accepted and the
/// returned record carries a fresh etag and the store clock's timestamp.
#[tokio::test]
async fn test_first_claim_is_accepted() {
    let clock = ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_000));
    let store = MemoryOwnershipStore::with_clock(Arc::new(clock.clone()));

    let accepted = store
        .claim_ownership(vec![claim("0", "owner-a", None)])
        .await
        .unwrap();

    assert_eq!(accepted.len(), 1);
    assert!(accepted[0].etag.is_some());
    assert_eq!(accepted[0].last_modified, Some(clock.now()));

    let listed = store.list_ownership("hub", "$default").await.unwrap();
    assert_eq!(listed, accepted);
}

/// **Test:** Stale etag loses the race
///
/// **Reason:** Two instances reading the same snapshot both try to claim; only the
/// first conditional write may win.
///
/// **Expectation:** The second claim, carrying the pre-race etag, is silently dropped
/// from the accepted list and the stored owner is the winner.
#[tokio::test]
async fn test_stale_etag_is_rejected() {
    let store = MemoryOwnershipStore::new();
    let first = store
        .claim_ownership(vec![claim("0", "owner-a", None)])
        .await
        .unwrap();
    let snapshot_etag = first[0].etag.clone();

    let winner = store
        .claim_ownership(vec![claim("0", "owner-b", snapshot_etag.clone())])
        .await
        .unwrap();
    assert_eq!(winner.len(), 1);

    let loser = store
        .claim_ownership(vec![claim("0", "owner-c", snapshot_etag)])
        .await
        .unwrap();
    assert!(loser.is_empty());

    let listed = store.list_ownership("hub", "$default").await.unwrap();
    assert_eq!(listed[0].owner(), Some("owner-b"));
}

/// **Test:** Per-record outcome in a batched claim
///
/// **Reason:** The balancer renews owned partitions and claims new ones in one call;
/// a conflict on one record must not reject the others.
///
/// **Expectation:** Only the record with a matching etag is returned.
#[tokio::test]
async fn test_batched_claim_is_per_record() {
    let store = MemoryOwnershipStore::new();
    let initial = store
        .claim_ownership(vec![claim("0", "owner-a", None), claim("1", "owner-a", None)])
        .await
        .unwrap();

    let accepted = store
        .claim_ownership(vec![
            claim("0", "owner-a", initial[0].etag.clone()),
            claim("1", "owner-a", Some("bogus".to_string())),
        ])
        .await
        .unwrap();

    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].partition_id, "0");
}

/// **Test:** Malformed batch writes nothing
///
/// **Reason:** A caller receiving an error cannot tell which records of the batch were
/// applied, so an invalid request must reject the whole claim.
///
/// **Expectation:** A valid claim followed by one without a partition id fails with
/// InvalidArguments and leaves the store empty.
#[tokio::test]
async fn test_invalid_request_rejects_whole_batch() {
    let store = MemoryOwnershipStore::new();

    let result = store
        .claim_ownership(vec![claim("0", "owner-a", None), claim("", "owner-a", None)])
        .await;

    assert!(matches!(result, Err(StoreError::InvalidArguments(_))));
    assert!(store.list_ownership("hub", "$default").await.unwrap().is_empty());
}

/// **Test:** Listing is scoped to event hub and consumer group
#[tokio::test]
async fn test_list_is_scoped() {
    let store = MemoryOwnershipStore::new();
    store
        .claim_ownership(vec![
            claim("0", "owner-a", None),
            PartitionOwnership::new("other-hub", "$default", "0").with_owner("owner-a"),
            PartitionOwnership::new("hub", "analytics", "0").with_owner("owner-a"),
        ])
        .await
        .unwrap();

    assert_eq!(store.list_ownership("hub", "$default").await.unwrap().len(), 1);
    assert_eq!(store.list_ownership("hub", "analytics").await.unwrap().len(), 1);
    assert!(store.list_ownership("hub", "missing").await.unwrap().is_empty());
}

/// **Test:** Checkpoints overwrite per partition
#[tokio::test]
async fn test_checkpoints_roundtrip() {
    let store = MemoryOwnershipStore::new();
    for sequence_number in [3, 7] {
        store
            .update_checkpoint(Checkpoint {
                event_hub_name: "hub".into(),
                consumer_group: "$default".into(),
                partition_id: "2".into(),
                offset: sequence_number as u64,
                sequence_number,
            })
            .await
            .unwrap();
    }

    let checkpoints = store.list_checkpoints("hub", "$default").await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].sequence_number, 7);

    let invalid = store
        .update_checkpoint(Checkpoint {
            event_hub_name: "hub".into(),
            consumer_group: "$default".into(),
            partition_id: String::new(),
            offset: 0,
            sequence_number: 0,
        })
        .await;
    assert!(matches!(invalid, Err(StoreError::InvalidArguments(_))));
}

/// **Test:** Activity window on ownership records
///
/// **Reason:** Inactivity expiry and empty owners drive reclaiming.
///
/// **Expectation:** A record is active only with a non-empty owner and an age within
/// the threshold.
#[test]
fn test_ownership_activity() {
    let now = UNIX_EPOCH + Duration::from_secs(10_000);
    let threshold = Duration::from_secs(60);

    let mut record = claim("0", "owner-a", None);
    record.last_modified = Some(now - Duration::from_secs(30));
    assert!(record.is_active(now, threshold));

    record.last_modified = Some(now - Duration::from_secs(61));
    assert!(!record.is_active(now, threshold));

    record.last_modified = Some(now);
    record.owner_id = Some(String::new());
    assert!(!record.is_active(now, threshold));

    record.owner_id = None;
    assert!(!record.is_active(now, threshold));

    let fresh: SystemTime = now + Duration::from_secs(5);
    let mut ahead = claim("0", "owner-a", None);
    ahead.last_modified = Some(fresh);
    assert!(ahead.is_active(now, threshold));
}
