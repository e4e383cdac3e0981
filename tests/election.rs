//! End-to-end scenarios (spec §8) against a live etcd endpoint. Run with
//! an etcd server reachable at `ETCD_ENDPOINT` (defaults to
//! `http://localhost:2379`, e.g. `etcd --listen-client-urls
//! http://0.0.0.0:2379 --advertise-client-urls http://127.0.0.1:2379`).

mod common;

use std::sync::{Arc, Mutex};

use etcd_client::{GetOptions, SortOrder, SortTarget};
use etcd_election::{Election, ElectionConfig, Event};

use common::{start_candidate, test_store, wait_for_condition, POLL_INTERVAL, WAIT_TIMEOUT};

/// Collects dispatched events behind a mutex so test bodies can poll them
/// without the observer closure itself needing to be `Sync`.
#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    fn observer(&self) -> etcd_election::Observer {
        let log = self.0.clone();
        Box::new(move |event: Event| log.lock().unwrap().push(event))
    }

    fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    fn last_leader_data(&self) -> Option<String> {
        self.events()
            .into_iter()
            .rev()
            .find(|e| e.err.is_none())
            .map(|e| e.leader_data)
    }
}

#[tokio::test]
async fn solo_election_becomes_leader() {
    let store = test_store("solo").await;
    let log = EventLog::default();
    let config = ElectionConfig::new("presidental")
        .with_candidate("alice")
        .with_ttl_secs(5)
        .with_observer(log.observer());
    let election = tokio::time::timeout(WAIT_TIMEOUT, Election::new(store.clone(), config))
        .await
        .expect("construction timed out")
        .expect("construction failed");

    assert!(election.is_leader());
    let events = log.events();
    let leader_event = events
        .iter()
        .find(|e| e.err.is_none())
        .expect("at least one clean leader-change event");
    assert!(leader_event.is_leader);
    assert_eq!(leader_event.leader_data, "alice");
    assert!(leader_event.leader_key.contains("/elections/presidental/"));

    election.close().await;
    let _ = store.delete_all().await;
}

#[tokio::test]
async fn two_candidates_second_follows_first_then_takes_over_on_close() {
    let store = test_store("two-candidates").await;

    let alice = start_candidate(store.clone(), "presidental", "alice", 5).await;
    assert!(alice.is_leader());

    let bob_log = EventLog::default();
    let bob_config = ElectionConfig::new("presidental")
        .with_candidate("bob")
        .with_ttl_secs(5)
        .with_observer(bob_log.observer());
    let bob = tokio::time::timeout(WAIT_TIMEOUT, Election::new(store.clone(), bob_config))
        .await
        .expect("construction timed out")
        .expect("construction failed");

    assert!(!bob.is_leader());
    assert_eq!(bob_log.last_leader_data().as_deref(), Some("alice"));

    alice.close().await;

    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async { bob.is_leader() }).await;
    assert_eq!(bob_log.last_leader_data().as_deref(), Some("bob"));

    bob.close().await;
    let _ = store.delete_all().await;
}

#[tokio::test]
async fn concede_steps_down_and_keeps_campaigning() {
    let store = test_store("concede").await;

    let alice = start_candidate(store.clone(), "presidental", "alice", 5).await;
    assert!(alice.is_leader());

    let bob_log = EventLog::default();
    let bob_config = ElectionConfig::new("presidental")
        .with_candidate("bob")
        .with_ttl_secs(5)
        .with_observer(bob_log.observer());
    let bob = tokio::time::timeout(WAIT_TIMEOUT, Election::new(store.clone(), bob_config))
        .await
        .expect("construction timed out")
        .expect("construction failed");
    assert!(!bob.is_leader());

    let was_leader = alice.concede().await.expect("concede failed");
    assert!(was_leader);

    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async { bob.is_leader() }).await;
    assert_eq!(bob_log.last_leader_data().as_deref(), Some("bob"));

    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async { !alice.is_leader() }).await;

    // A second concede on a non-leader is a no-op.
    let was_leader_again = alice.concede().await.expect("second concede failed");
    assert!(!was_leader_again);

    alice.close().await;
    bob.close().await;
    let _ = store.delete_all().await;
}

#[tokio::test]
async fn session_loss_elects_a_survivor() {
    let store = test_store("session-loss").await;

    let alice = start_candidate(store.clone(), "presidental", "alice", 5).await;
    assert!(alice.is_leader());

    let bob_log = EventLog::default();
    let bob_config = ElectionConfig::new("presidental")
        .with_candidate("bob")
        .with_ttl_secs(5)
        .with_observer(bob_log.observer());
    let bob = tokio::time::timeout(WAIT_TIMEOUT, Election::new(store.clone(), bob_config))
        .await
        .expect("construction timed out")
        .expect("construction failed");

    // Revoke alice's lease out-of-band, bypassing the session's own
    // `Close`/`Concede` paths, to simulate an unannounced connectivity loss.
    let prefix = format!("{}elections/presidental/", store.prefix());
    let get_options = GetOptions::new()
        .with_prefix()
        .with_sort(SortTarget::Create, SortOrder::Ascend)
        .with_limit(1);
    let resp = store
        .client()
        .clone()
        .get(prefix.clone(), Some(get_options))
        .await
        .expect("get failed");
    let leader_kv = resp.kvs().first().expect("a leader key must exist");
    assert_eq!(leader_kv.value(), b"alice");
    store
        .client()
        .clone()
        .lease_revoke(leader_kv.lease())
        .await
        .expect("lease revoke failed");

    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async { !alice.is_leader() }).await;
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async { bob.is_leader() }).await;
    assert_eq!(bob_log.last_leader_data().as_deref(), Some("bob"));

    alice.close().await;
    bob.close().await;
    let _ = store.delete_all().await;
}

#[tokio::test]
async fn close_emits_terminal_event_and_clears_leadership() {
    let store = test_store("close").await;
    let log = EventLog::default();
    let config = ElectionConfig::new("presidental")
        .with_candidate("alice")
        .with_ttl_secs(5)
        .with_observer(log.observer());
    let election = tokio::time::timeout(WAIT_TIMEOUT, Election::new(store.clone(), config))
        .await
        .expect("construction timed out")
        .expect("construction failed");
    assert!(election.is_leader());

    election.close().await;

    let events = log.events();
    let terminal = events.last().expect("at least one event recorded");
    assert!(terminal.is_done);
    assert!(!terminal.is_leader);
    assert_eq!(events.iter().filter(|e| e.is_done).count(), 1);

    let _ = store.delete_all().await;
}

#[tokio::test]
async fn empty_election_name_is_a_configuration_error() {
    let store = test_store("empty-name").await;
    let config = ElectionConfig::new("");
    let result = Election::new(store, config).await;
    assert!(matches!(result, Err(etcd_election::Error::Config(_))));
}

