//! Behavioural suite every `EventStore` backend must pass.
//!
//! Call [`run_acceptance_suite`] from a backend's integration tests with a
//! freshly created, empty store.

use chrono::{DateTime, Duration, TimeZone, Utc};
use strata_core::event::Event;
use strata_core::store::{DeleteQuery, EventStore, SaveStatus, SnapshotQuery, VersionQuery};

use crate::event::{CollectingHandler, MockEvent, as_dyn, mock_events};

const GROUP_1: &str = "b1b5f4c0-1c2e-4d84-9f0e-3a51d1fa0001";
const GROUP_2: &str = "b1b5f4c0-1c2e-4d84-9f0e-3a51d1fa0002";
const GROUP_3: &str = "b1b5f4c0-1c2e-4d84-9f0e-3a51d1fa0003";
const AGGREGATE_1: &str = "7f1a9a52-5a8e-4c36-8f0b-1d2f3a4b0001";
const AGGREGATE_2: &str = "7f1a9a52-5a8e-4c36-8f0b-1d2f3a4b0002";
const AGGREGATE_3: &str = "7f1a9a52-5a8e-4c36-8f0b-1d2f3a4b0003";
const AGGREGATE_4: &str = "7f1a9a52-5a8e-4c36-8f0b-1d2f3a4b0004";

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 4, 1, 13, 37, 0)
        .single()
        .unwrap()
}

async fn save(store: &dyn EventStore, events: &[MockEvent]) -> SaveStatus {
    store.save(&as_dyn(events)).await.unwrap()
}

fn versions(events: &[MockEvent]) -> Vec<u64> {
    events.iter().map(Event::version).collect()
}

async fn save_rejects_invalid_batches(store: &dyn EventStore) {
    assert!(store.save(&[]).await.is_err(), "empty batch must fail");

    let mut decreasing = mock_events(0, 2, false, GROUP_1, AGGREGATE_1, start());
    decreasing[1].timestamp = decreasing[0].timestamp - Duration::seconds(1);
    assert!(
        store.save(&as_dyn(&decreasing)).await.is_err(),
        "decreasing timestamps must fail"
    );

    let mut late_snapshot = mock_events(0, 2, false, GROUP_1, AGGREGATE_1, start());
    late_snapshot[1].is_snapshot = true;
    assert!(
        store.save(&as_dyn(&late_snapshot)).await.is_err(),
        "snapshot after first position must fail"
    );
}

async fn save_enforces_version_order(store: &dyn EventStore) {
    let a1 = mock_events(0, 6, false, GROUP_1, AGGREGATE_1, start());

    assert_eq!(save(store, &a1[0..1]).await, SaveStatus::Ok);
    assert_eq!(save(store, &a1[1..2]).await, SaveStatus::Ok);
    assert_eq!(
        save(store, &a1[1..2]).await,
        SaveStatus::ConcurrencyException,
        "same version twice"
    );
    assert_eq!(
        save(store, &a1[0..1]).await,
        SaveStatus::ConcurrencyException,
        "version 0 of an existing aggregate"
    );
    assert_eq!(
        save(store, &a1[3..4]).await,
        SaveStatus::ConcurrencyException,
        "version gap"
    );
    assert_eq!(save(store, &a1[2..3]).await, SaveStatus::Ok);
    assert_eq!(save(store, &a1[3..6]).await, SaveStatus::Ok);

    let unknown = mock_events(5, 1, false, GROUP_2, AGGREGATE_3, start());
    assert_eq!(
        save(store, &unknown).await,
        SaveStatus::ConcurrencyException,
        "non-zero version of an unknown aggregate"
    );

    let a2 = mock_events(0, 4, false, GROUP_1, AGGREGATE_2, start());
    assert_eq!(save(store, &a2).await, SaveStatus::Ok);
}

async fn load_from_snapshot_starts_at_latest_snapshot(store: &dyn EventStore) {
    let plain = mock_events(0, 3, false, GROUP_3, AGGREGATE_4, start());
    let with_snapshot = mock_events(3, 4, true, GROUP_3, AGGREGATE_4, start());
    assert_eq!(save(store, &plain).await, SaveStatus::Ok);
    assert_eq!(save(store, &with_snapshot).await, SaveStatus::Ok);

    let handler = CollectingHandler::new();
    store
        .load_from_snapshot(&[SnapshotQuery::aggregate(GROUP_3, AGGREGATE_4)], &handler)
        .await
        .unwrap();
    let loaded: Vec<MockEvent> = handler.events().iter().map(MockEvent::from_loaded).collect();
    assert_eq!(loaded, with_snapshot);
}

async fn load_queries_select_aggregates(store: &dyn EventStore) {
    let a1 = versions(&mock_events(0, 6, false, GROUP_1, AGGREGATE_1, start()));
    let a2 = versions(&mock_events(0, 4, false, GROUP_1, AGGREGATE_2, start()));

    let missing = CollectingHandler::new();
    store
        .load_from_snapshot(&[SnapshotQuery::group("not-exist")], &missing)
        .await
        .unwrap();
    assert!(missing.is_empty(), "unknown group loads nothing");

    let single = CollectingHandler::new();
    store
        .load_from_snapshot(&[SnapshotQuery::aggregate(GROUP_1, AGGREGATE_1)], &single)
        .await
        .unwrap();
    assert_eq!(single.versions(GROUP_1, AGGREGATE_1), a1);
    assert_eq!(single.len(), a1.len());

    let from_version = CollectingHandler::new();
    store
        .load_from_version(&[VersionQuery::new(GROUP_1, AGGREGATE_1, 2)], &from_version)
        .await
        .unwrap();
    assert_eq!(from_version.versions(GROUP_1, AGGREGATE_1), vec![2, 3, 4, 5]);

    let both = CollectingHandler::new();
    store
        .load_from_version(
            &[
                VersionQuery::new(GROUP_1, AGGREGATE_1, 0),
                VersionQuery::new(GROUP_1, AGGREGATE_2, 0),
            ],
            &both,
        )
        .await
        .unwrap();
    assert_eq!(both.versions(GROUP_1, AGGREGATE_1), a1);
    assert_eq!(both.versions(GROUP_1, AGGREGATE_2), a2);

    let group = CollectingHandler::new();
    store
        .load_from_snapshot(&[SnapshotQuery::group(GROUP_1)], &group)
        .await
        .unwrap();
    assert_eq!(group.versions(GROUP_1, AGGREGATE_1), a1);
    assert_eq!(group.versions(GROUP_1, AGGREGATE_2), a2);

    let a3 = mock_events(0, 1, false, GROUP_2, AGGREGATE_3, start());
    assert_eq!(save(store, &a3).await, SaveStatus::Ok);
    let groups = CollectingHandler::new();
    store
        .load_from_snapshot(
            &[
                SnapshotQuery::group(GROUP_1),
                SnapshotQuery::group(GROUP_2),
                SnapshotQuery::group(GROUP_3),
            ],
            &groups,
        )
        .await
        .unwrap();
    assert_eq!(groups.versions(GROUP_1, AGGREGATE_1), a1);
    assert_eq!(groups.versions(GROUP_1, AGGREGATE_2), a2);
    assert_eq!(groups.versions(GROUP_2, AGGREGATE_3), vec![0]);
    assert_eq!(groups.versions(GROUP_3, AGGREGATE_4), vec![3, 4, 5, 6]);

    let all = CollectingHandler::new();
    store.load_from_snapshot(&[], &all).await.unwrap();
    assert_eq!(all.len(), groups.len(), "empty query list loads everything");

    let up_to = CollectingHandler::new();
    store
        .load_up_to_version(&[VersionQuery::new(GROUP_1, AGGREGATE_1, 3)], &up_to)
        .await
        .unwrap();
    assert_eq!(up_to.versions(GROUP_1, AGGREGATE_1), vec![0, 1, 2]);

    let invalid = CollectingHandler::new();
    assert!(
        store
            .load_from_snapshot(&[SnapshotQuery::group("")], &invalid)
            .await
            .is_err(),
        "empty group id must fail"
    );
    assert!(
        store
            .load_from_version(&[VersionQuery::new(GROUP_1, "", 0)], &invalid)
            .await
            .is_err(),
        "empty aggregate id must fail"
    );
}

async fn remove_up_to_version_keeps_stream_writable(store: &dyn EventStore) {
    store
        .remove_up_to_version(&[VersionQuery::new(GROUP_1, AGGREGATE_1, 3)])
        .await
        .unwrap();

    let handler = CollectingHandler::new();
    store
        .load_from_snapshot(&[SnapshotQuery::aggregate(GROUP_1, AGGREGATE_1)], &handler)
        .await
        .unwrap();
    assert_eq!(handler.versions(GROUP_1, AGGREGATE_1), vec![3, 4, 5]);

    let next = mock_events(6, 1, false, GROUP_1, AGGREGATE_1, start());
    assert_eq!(save(store, &next).await, SaveStatus::Ok);
}

async fn delete_removes_whole_groups(store: &dyn EventStore) {
    assert!(store.delete(&[]).await.is_err(), "empty delete must fail");

    store.delete(&[DeleteQuery::new(GROUP_1)]).await.unwrap();

    let handler = CollectingHandler::new();
    store.load_from_snapshot(&[], &handler).await.unwrap();
    assert!(handler.versions(GROUP_1, AGGREGATE_1).is_empty());
    assert!(handler.versions(GROUP_1, AGGREGATE_2).is_empty());
    assert_eq!(handler.versions(GROUP_2, AGGREGATE_3), vec![0]);
}

/// Runs every scenario in order against `store`, which must start empty.
///
/// # Panics
///
/// Panics on the first contract violation.
pub async fn run_acceptance_suite(store: &dyn EventStore) {
    save_rejects_invalid_batches(store).await;
    save_enforces_version_order(store).await;
    load_from_snapshot_starts_at_latest_snapshot(store).await;
    load_queries_select_aggregates(store).await;
    remove_up_to_version_keeps_stream_writable(store).await;
    delete_removes_whole_groups(store).await;
}
