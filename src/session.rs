use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::error::Error;
use crate::store::EtcdStore;

/// Sentinel denoting the session's lost state. No real etcd lease is ever
/// issued with this id.
pub const NO_LEASE: i64 = 0;

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub ttl_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { ttl_secs: 5 }
    }
}

enum SessionCommand {
    Reset(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Owns a lease on the KV store, keeps it alive, and reports lease-ID
/// transitions to a single observer (component B).
///
/// The keepalive runs in a dedicated task; the session task itself is the
/// sole caller of `observer`, so callbacks are always invoked serially.
pub struct Session {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

impl Session {
    pub fn start(
        store: Arc<EtcdStore>,
        config: SessionConfig,
        observer: impl FnMut(i64, Option<Error>) + Send + 'static,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(session_task(store, config, cmd_rx, observer));
        Self { cmd_tx, task }
    }

    /// Forces a synchronous transition: the current lease is revoked, the
    /// observer is notified of the loss, and re-acquisition begins. Returns
    /// once the loss has been observed (re-acquisition continues async).
    pub async fn reset(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(SessionCommand::Reset(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Revokes the lease, stops keepalives, and returns once the session
    /// task has wound down.
    pub async fn close(self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.cmd_tx.send(SessionCommand::Close(tx));
        let _ = rx.await;
        let _ = self.task.await;
    }
}

async fn session_task(
    store: Arc<EtcdStore>,
    config: SessionConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    mut observer: impl FnMut(i64, Option<Error>),
) {
    let keepalive_interval = Duration::from_secs((config.ttl_secs.max(3) / 3) as u64);
    let mut backoff = Backoff::with_ttl_cap(config.ttl_secs);

    'acquire: loop {
        let lease_id = loop {
            match store.grant_lease(config.ttl_secs).await {
                Ok(id) => break id,
                Err(e) => {
                    observer(NO_LEASE, Some(e));
                    tokio::select! {
                        _ = tokio::time::sleep(backoff.next()) => {}
                        cmd = cmd_rx.recv() => match cmd {
                            Some(SessionCommand::Close(ack)) => { let _ = ack.send(()); return; }
                            Some(SessionCommand::Reset(ack)) => { let _ = ack.send(()); }
                            None => return,
                        },
                    }
                }
            }
        };
        backoff.reset();
        observer(lease_id, None);

        let keepalive_cancel = CancellationToken::new();
        let (fail_tx, mut fail_rx) = oneshot::channel();
        let keepalive_handle = {
            let store = store.clone();
            let cancel = keepalive_cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = run_keepalive(store, lease_id, keepalive_interval, cancel).await {
                    let _ = fail_tx.send(e);
                }
            })
        };

        let lost_err = tokio::select! {
            res = &mut fail_rx => res.ok(),
            cmd = cmd_rx.recv() => {
                keepalive_cancel.cancel();
                let _ = keepalive_handle.await;
                match cmd {
                    Some(SessionCommand::Reset(ack)) => {
                        let _ = store.revoke_lease(lease_id).await;
                        observer(NO_LEASE, None);
                        let _ = ack.send(());
                        continue 'acquire;
                    }
                    Some(SessionCommand::Close(ack)) => {
                        let _ = store.revoke_lease(lease_id).await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        let _ = store.revoke_lease(lease_id).await;
                        return;
                    }
                }
            }
        };

        keepalive_cancel.cancel();
        let _ = keepalive_handle.await;
        observer(NO_LEASE, lost_err);
        // loop back and attempt re-acquisition under a fresh lease
    }
}

async fn run_keepalive(
    store: Arc<EtcdStore>,
    lease_id: i64,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let (mut keeper, mut stream) = store.keep_alive(lease_id).await?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {
                keeper.keep_alive().await?;
                match stream.message().await? {
                    Some(resp) if resp.ttl() > 0 => {}
                    _ => return Err(Error::LeadershipLost),
                }
            }
        }
    }
}
