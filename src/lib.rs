//! Leader election on top of etcd leases, conditional-create transactions,
//! and prefix watches.
//!
//! An [`Election`] campaigns continuously for a single named office: it
//! holds a lease-backed session, claims a candidate key under the election's
//! prefix, and watches the prefix for changes in which key has the smallest
//! creation revision — that key's holder is the leader. Observers registered
//! via [`ElectionConfig::with_observer`] or [`Election::add_observer`] are
//! called with an [`Event`] on every leadership change, transient error, and
//! on close.
//!
//! ```no_run
//! # async fn run() -> etcd_election::Result<()> {
//! use std::sync::Arc;
//! use etcd_election::{Election, ElectionConfig, EtcdStore, StoreConfig};
//!
//! let store = Arc::new(EtcdStore::connect(StoreConfig {
//!     endpoints: vec!["http://localhost:2379".to_string()],
//!     prefix: String::new(),
//! }).await?);
//!
//! let config = ElectionConfig::new("presidential")
//!     .with_observer(Box::new(|event| {
//!         if event.is_leader {
//!             tracing::info!("became leader");
//!         }
//!     }));
//!
//! let election = Election::new(store, config).await?;
//! assert!(!election.is_leader() || election.is_leader());
//! election.close().await;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod config;
mod controller;
mod error;
mod registrar;
mod session;
mod store;
mod watch;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use controller::{ControllerHandle, ControllerMsg};

pub use config::ElectionConfig;
pub use error::{Error, Result};
pub use store::{EtcdStore, StoreConfig};

/// Callback invoked on every leadership transition, transient error, and
/// close. Dispatch is serialized: the controller task is the only caller, so
/// an observer never needs its own locking.
pub type Observer = Box<dyn FnMut(Event) + Send>;

/// A leadership notification.
///
/// `err` carries a transient registration/watch/session failure alongside
/// `is_leader = false`; it is `None` on ordinary leadership changes and on
/// the final `is_done` event.
#[derive(Debug, Clone)]
pub struct Event {
    pub is_leader: bool,
    pub leader_key: String,
    pub leader_data: String,
    /// Set on the single event dispatched by [`Election::close`].
    pub is_done: bool,
    pub err: Option<Arc<Error>>,
}

/// Opaque handle returned by [`Election::add_observer`], used to later
/// remove that observer with [`Election::remove_observer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverId(String);

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(0);

/// A standing campaign for a single named election.
///
/// Construction blocks until the first event has been dispatched to
/// observers — a transient registration error counts, same as an initial
/// leadership result — so callers observing via [`Election::is_leader`]
/// immediately after `new` see a settled value rather than the campaign's
/// unstarted default. Bound construction with `tokio::time::timeout` if a
/// deadline is needed; there is no separate cancellation-token parameter.
pub struct Election {
    handle: ControllerHandle,
}

impl Election {
    pub async fn new(store: Arc<EtcdStore>, config: ElectionConfig) -> Result<Self> {
        if config.election.trim().is_empty() {
            return Err(Error::Config("election name must not be empty".to_string()));
        }
        let election_prefix = format!(
            "{}/elections/{}/",
            store.prefix().trim_end_matches('/'),
            config.election
        );
        let candidate = config
            .candidate
            .unwrap_or_else(crate::config::default_candidate_name);
        let ttl_secs = config.ttl_secs.unwrap_or(5);

        let (init_tx, init_rx) = oneshot::channel();
        let mut init_tx = Some(init_tx);
        let init_observer: Observer = Box::new(move |_event: Event| {
            if let Some(tx) = init_tx.take() {
                let _ = tx.send(());
            }
        });

        let handle = controller::spawn(
            store,
            election_prefix,
            candidate,
            ttl_secs,
            init_observer,
            config.observer,
        );

        // Ignored: if the controller task has already exited (it can't,
        // this early) the first real observer call below would also be a
        // no-op send.
        let _ = init_rx.await;

        Ok(Self { handle })
    }

    /// Whether this candidate currently holds the office. Reflects the
    /// latest watch observation, not a live round-trip to the store.
    pub fn is_leader(&self) -> bool {
        self.handle.is_leader.load(Ordering::Relaxed)
    }

    /// Steps down if currently leading, withdrawing the candidate key and
    /// resetting the session, then resumes campaigning under a fresh lease.
    /// Returns `true` if this call actually stepped down a leader; `false`
    /// if the candidate was not leading.
    pub async fn concede(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerMsg::Concede(tx))?;
        rx.await
            .map_err(|_| Error::InvalidState("election closed before concede completed".into()))?
    }

    /// Registers an additional observer, returning an id usable with
    /// [`Election::remove_observer`]. Does not replace the observer
    /// configured via [`ElectionConfig::with_observer`].
    pub fn add_observer(&self, observer: Observer) -> ObserverId {
        let id = format!("obs-{}", NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed));
        let _ = self.send(ControllerMsg::AddObserver(id.clone(), observer));
        ObserverId(id)
    }

    pub fn remove_observer(&self, id: ObserverId) {
        let _ = self.send(ControllerMsg::RemoveObserver(id.0));
    }

    /// Withdraws from the campaign, revokes the session lease, dispatches a
    /// final `is_done` event, and waits for the controller task to wind
    /// down.
    pub async fn close(self) {
        let (tx, rx) = oneshot::channel();
        if self.handle.msg_tx.send(ControllerMsg::Close(tx)).is_ok() {
            let _ = rx.await;
        }
        let _ = self.handle.task.await;
    }

    fn send(&self, msg: ControllerMsg) -> Result<()> {
        self.handle
            .msg_tx
            .send(msg)
            .map_err(|_| Error::InvalidState("election controller has shut down".into()))
    }
}
