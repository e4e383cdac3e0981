use std::sync::Arc;
use std::time::Duration;

use etcd_client::EventType;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::store::EtcdStore;

/// The identity of the election's current leader as last observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderInfo {
    pub key: String,
    pub data: String,
}

/// A `LeaderChange` notification, bound to whether `own_key` matches.
#[derive(Debug, Clone)]
pub struct LeaderChange {
    pub is_leader: bool,
    pub leader_key: String,
    pub leader_data: String,
}

/// How the watch loop ended.
pub enum WatchExit {
    /// The local shutdown signal fired; the candidate key was withdrawn
    /// (best-effort, within `ttl_secs`) and an empty-leader event emitted.
    ShutDown,
    /// The watch stream ended without being canceled by the server and
    /// without a transport error — a non-fatal termination. The candidate
    /// key has already been withdrawn; the caller should back off and
    /// re-register under the same lease.
    Retry,
    /// `Canceled` by the server, a non-nil response error, or no leader
    /// found when the watch began — fatal. The caller should reset the
    /// session, which cascades into a fresh registration under a new lease.
    Fatal(Error),
}

/// Runs the watch loop (component D): queries the current leader, opens a
/// revision-bounded prefix watch, and dispatches `LeaderChange` events
/// whenever the first-created key under the prefix changes identity.
#[allow(clippy::too_many_arguments)]
pub async fn run_watch(
    store: Arc<EtcdStore>,
    election_prefix: String,
    own_key: String,
    start_revision: i64,
    ttl_secs: i64,
    events: mpsc::UnboundedSender<LeaderChange>,
    shutdown: CancellationToken,
) -> WatchExit {
    let current = match store.get_first_created(&election_prefix).await {
        Ok(Some((key, value, _rev))) => LeaderInfo {
            key,
            data: String::from_utf8_lossy(&value).into_owned(),
        },
        // Preserve-but-fix (§9 OQ4 / DESIGN.md): the source wraps this as
        // `errors.Wrap(err, ...)` with `err == nil`, which yields a nil
        // error and silently swallows "no leader when watch began". Here it
        // is a distinct, non-nil, fatal error instead.
        Ok(None) => {
            return WatchExit::Fatal(Error::InvalidState(
                "no leader when election watch began".to_string(),
            ))
        }
        Err(e) => return WatchExit::Fatal(e),
    };
    let mut current = current;
    emit(&events, &own_key, &current);

    let (mut watcher, mut stream) = match store.watch(&election_prefix, start_revision + 1).await {
        Ok(pair) => pair,
        Err(e) => return WatchExit::Fatal(e),
    };

    // Substitute for etcd's `WithRequireLeader` (OQ5, DESIGN.md): periodic
    // progress probes double as a fail-fast quorum check, since a cluster
    // that can't service them is the same condition `RequireLeader` guards
    // against. An interval below `ttl_secs` keeps this tighter than the
    // keepalive cadence that would otherwise notice lease loss first.
    let mut progress_probe = tokio::time::interval(Duration::from_secs(
        (ttl_secs.max(3) / 3).max(1) as u64,
    ));
    progress_probe.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                withdraw(&store, &own_key, ttl_secs).await;
                emit(&events, &own_key, &LeaderInfo::default());
                return WatchExit::ShutDown;
            }
            _ = progress_probe.tick() => {
                if let Err(e) = watcher.request_progress().await {
                    return WatchExit::Fatal(e.into());
                }
            }
            msg = stream.message() => {
                let resp = match msg {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        withdraw(&store, &own_key, ttl_secs).await;
                        return WatchExit::Retry;
                    }
                    Err(e) => return WatchExit::Fatal(e.into()),
                };

                if resp.canceled() {
                    return WatchExit::Fatal(Error::InvalidState(
                        "watch canceled by server".to_string(),
                    ));
                }

                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    if kv.key_str().unwrap_or_default() != current.key {
                        continue;
                    }
                    if !matches!(event.event_type(), EventType::Put | EventType::Delete) {
                        continue;
                    }
                    match store.get_first_created(&election_prefix).await {
                        Ok(Some((key, value, _rev))) => {
                            let data = String::from_utf8_lossy(&value).into_owned();
                            if key != current.key || data != current.data {
                                current = LeaderInfo { key, data };
                                emit(&events, &own_key, &current);
                            }
                        }
                        Ok(None) => {
                            return WatchExit::Fatal(Error::InvalidState(
                                "no leader after leader-key event".to_string(),
                            ));
                        }
                        Err(e) => return WatchExit::Fatal(e),
                    }
                }
            }
        }
    }
}

fn emit(events: &mpsc::UnboundedSender<LeaderChange>, own_key: &str, leader: &LeaderInfo) {
    let _ = events.send(LeaderChange {
        is_leader: !leader.key.is_empty() && leader.key == own_key,
        leader_key: leader.key.clone(),
        leader_data: leader.data.clone(),
    });
}

/// Deletes `key`, bounded by `ttl_secs`: if the store stays unreachable
/// longer than that, the lease expires and the key vanishes regardless.
async fn withdraw(store: &EtcdStore, key: &str, ttl_secs: i64) {
    let deadline = Duration::from_secs(ttl_secs.max(1) as u64);
    match tokio::time::timeout(deadline, store.delete(key)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(key = %key, error = %e, "withdrawal delete failed"),
        Err(_) => tracing::warn!(key = %key, "withdrawal timed out within TTL"),
    }
}
