use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::registrar;
use crate::session::{Session, SessionConfig, NO_LEASE};
use crate::store::EtcdStore;
use crate::watch::{self, LeaderChange, WatchExit};
use crate::{Event, Observer};

pub(crate) enum ControllerMsg {
    /// Forwarded from the session's observer callback.
    SessionEvent { lease_id: i64, err: Option<Error> },
    /// Forwarded once a campaign task's registrar call succeeds, so the
    /// controller can snapshot the candidate's own active key for `Concede`.
    Registered(String),
    /// Forwarded from the watch loop.
    LeaderChange(LeaderChange),
    /// Forwarded when a campaign task (registrar + watch loop) ends.
    CampaignEnded(CampaignOutcome),
    Concede(oneshot::Sender<Result<bool>>),
    Close(oneshot::Sender<()>),
    AddObserver(String, Observer),
    RemoveObserver(String),
}

pub(crate) enum CampaignOutcome {
    /// A transient registrar/watch error; retried with backoff under the
    /// same lease.
    Retryable(Error),
    /// A fatal watch error (server cancel, transport error, no leader at
    /// watch start); the session is reset, which cascades into a fresh
    /// registration under a new lease.
    Fatal(Error),
    /// The campaign withdrew cleanly because the controller is shutting
    /// down.
    ShutDown,
}

struct ControllerState {
    store: Arc<EtcdStore>,
    election_prefix: String,
    candidate: String,
    ttl_secs: i64,
    is_leader: Arc<AtomicBool>,
    observers: HashMap<String, Observer>,
    current_leader_key: String,
    /// `(is_leader, leader_key)` of the last leader-identity event actually
    /// dispatched; used to suppress spurious same-leader repeats (spec §8
    /// invariant 3). Error-carrying events are never suppressed by this.
    last_leader_state: (bool, String),
    current_key: String,
    campaign: Option<(JoinHandle<()>, CancellationToken)>,
    bg: CancellationToken,
    closing: bool,
}

pub(crate) struct ControllerHandle {
    pub is_leader: Arc<AtomicBool>,
    pub msg_tx: mpsc::UnboundedSender<ControllerMsg>,
    pub task: JoinHandle<()>,
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    store: Arc<EtcdStore>,
    election_prefix: String,
    candidate: String,
    ttl_secs: i64,
    init_observer: Observer,
    conf_observer: Option<Observer>,
) -> ControllerHandle {
    let is_leader = Arc::new(AtomicBool::new(false));
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();

    let mut observers: HashMap<String, Observer> = HashMap::new();
    observers.insert("init".to_string(), init_observer);
    if let Some(obs) = conf_observer {
        observers.insert("conf".to_string(), obs);
    }

    let session_tx = msg_tx.clone();
    let session = Session::start(
        store.clone(),
        SessionConfig { ttl_secs },
        move |lease_id, err| {
            let _ = session_tx.send(ControllerMsg::SessionEvent { lease_id, err });
        },
    );

    let state = ControllerState {
        store,
        election_prefix,
        candidate,
        ttl_secs,
        is_leader: is_leader.clone(),
        observers,
        current_leader_key: String::new(),
        last_leader_state: (false, String::new()),
        current_key: String::new(),
        campaign: None,
        bg: CancellationToken::new(),
        closing: false,
    };

    let task = tokio::spawn(run(state, msg_rx, msg_tx.clone(), session));

    ControllerHandle {
        is_leader,
        msg_tx,
        task,
    }
}

async fn run(
    mut state: ControllerState,
    mut msg_rx: mpsc::UnboundedReceiver<ControllerMsg>,
    msg_tx: mpsc::UnboundedSender<ControllerMsg>,
    mut session: Session,
) {
    while let Some(msg) = msg_rx.recv().await {
        match msg {
            ControllerMsg::SessionEvent { lease_id, err } => {
                stop_campaign(&mut state).await;
                if lease_id == NO_LEASE {
                    dispatch_leader_event(&mut state, false, String::new(), String::new(), err);
                } else if !state.closing {
                    start_campaign(&mut state, lease_id, msg_tx.clone());
                }
            }
            ControllerMsg::Registered(key) => {
                state.current_key = key;
            }
            ControllerMsg::LeaderChange(change) => {
                state.current_leader_key = change.leader_key.clone();
                dispatch_leader_event(
                    &mut state,
                    change.is_leader,
                    change.leader_key,
                    change.leader_data,
                    None,
                );
            }
            ControllerMsg::CampaignEnded(outcome) => match outcome {
                CampaignOutcome::Retryable(e) => {
                    let leader_key = state.current_leader_key.clone();
                    dispatch_leader_event(&mut state, false, leader_key, String::new(), Some(e));
                }
                CampaignOutcome::Fatal(e) => {
                    dispatch_leader_event(&mut state, false, String::new(), String::new(), Some(e));
                    session.reset().await;
                }
                CampaignOutcome::ShutDown => {}
            },
            ControllerMsg::Concede(ack) => {
                let result = handle_concede(&mut state, &session).await;
                let _ = ack.send(result);
            }
            ControllerMsg::Close(ack) => {
                state.closing = true;
                state.bg.cancel();
                stop_campaign(&mut state).await;
                session.close().await;
                set_leader(&state, false);
                dispatch(
                    &mut state,
                    Event {
                        is_leader: false,
                        leader_key: String::new(),
                        leader_data: String::new(),
                        is_done: true,
                        err: None,
                    },
                );
                let _ = ack.send(());
                return;
            }
            ControllerMsg::AddObserver(id, observer) => {
                state.observers.insert(id, observer);
            }
            ControllerMsg::RemoveObserver(id) => {
                state.observers.remove(&id);
            }
        }
    }
}

fn set_leader(state: &ControllerState, value: bool) {
    state.is_leader.store(value, Ordering::Relaxed);
}

fn dispatch(state: &mut ControllerState, event: Event) {
    for observer in state.observers.values_mut() {
        observer(event.clone());
    }
}

/// Dispatches a leader-identity notification (watch changes, session loss,
/// campaign retries/faults), suppressing it when it repeats the last
/// leader-identity event actually delivered and carries no error — spec §8
/// invariant 3 requires observers never see spurious same-leader repeats.
/// An error is always delivered even if the identity didn't change, since it
/// is itself new information.
fn dispatch_leader_event(
    state: &mut ControllerState,
    is_leader: bool,
    leader_key: String,
    leader_data: String,
    err: Option<Error>,
) {
    let identity = (is_leader, leader_key.clone());
    if err.is_none() && state.last_leader_state == identity {
        return;
    }
    state.last_leader_state = identity;
    set_leader(state, is_leader);
    dispatch(
        state,
        Event {
            is_leader,
            leader_key,
            leader_data,
            is_done: false,
            err: err.map(Arc::new),
        },
    );
}

async fn handle_concede(state: &mut ControllerState, session: &Session) -> Result<bool> {
    if !state.is_leader.load(Ordering::Relaxed) {
        return Ok(false);
    }
    let old_key = state.current_key.clone();

    // Step down once, then keep campaigning — contrast with `Close`.
    stop_campaign(state).await;
    session.reset().await;

    if !old_key.is_empty() {
        // The source cancels this context immediately before issuing the
        // delete, almost certainly making the delete observe a canceled
        // context (§9 OQ2). Here the TTL-bounded deadline is instead held
        // open until the delete actually completes — see DESIGN.md.
        let deadline = Duration::from_secs(state.ttl_secs.max(1) as u64);
        if tokio::time::timeout(deadline, state.store.delete(&old_key))
            .await
            .is_err()
        {
            tracing::warn!(key = %old_key, "concede: withdrawal of prior key timed out within TTL");
        }
    }
    Ok(true)
}

fn start_campaign(
    state: &mut ControllerState,
    lease_id: i64,
    msg_tx: mpsc::UnboundedSender<ControllerMsg>,
) {
    let token = state.bg.child_token();
    let store = state.store.clone();
    let election_prefix = state.election_prefix.clone();
    let candidate = state.candidate.clone();
    let ttl_secs = state.ttl_secs;
    let child = token.clone();
    let handle = tokio::spawn(async move {
        run_campaign(
            store,
            election_prefix,
            candidate,
            lease_id,
            ttl_secs,
            msg_tx,
            child,
        )
        .await;
    });
    state.campaign = Some((handle, token));
}

async fn stop_campaign(state: &mut ControllerState) {
    if let Some((handle, token)) = state.campaign.take() {
        token.cancel();
        let _ = handle.await;
    }
    state.current_key.clear();
}

#[allow(clippy::too_many_arguments)]
async fn run_campaign(
    store: Arc<EtcdStore>,
    election_prefix: String,
    candidate: String,
    lease_id: i64,
    ttl_secs: i64,
    events_tx: mpsc::UnboundedSender<ControllerMsg>,
    shutdown: CancellationToken,
) {
    let mut backoff = Backoff::with_ttl_cap(ttl_secs);

    loop {
        if shutdown.is_cancelled() {
            let _ = events_tx.send(ControllerMsg::CampaignEnded(CampaignOutcome::ShutDown));
            return;
        }

        let reg = match registrar::register(&store, &election_prefix, lease_id, &candidate).await
        {
            Ok(reg) => reg,
            Err(e) => {
                let _ =
                    events_tx.send(ControllerMsg::CampaignEnded(CampaignOutcome::Retryable(e)));
                if wait_or_shutdown(&mut backoff, &shutdown).await.is_err() {
                    let _ =
                        events_tx.send(ControllerMsg::CampaignEnded(CampaignOutcome::ShutDown));
                    return;
                }
                continue;
            }
        };
        backoff.reset();
        let _ = events_tx.send(ControllerMsg::Registered(reg.key.clone()));

        let (leader_tx, mut leader_rx) = mpsc::unbounded_channel();
        let bridge = {
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                while let Some(change) = leader_rx.recv().await {
                    let _ = events_tx.send(ControllerMsg::LeaderChange(change));
                }
            })
        };

        let exit = watch::run_watch(
            store.clone(),
            election_prefix.clone(),
            reg.key.clone(),
            reg.revision,
            ttl_secs,
            leader_tx,
            shutdown.clone(),
        )
        .await;
        drop(bridge);

        match exit {
            WatchExit::ShutDown => {
                let _ = events_tx.send(ControllerMsg::CampaignEnded(CampaignOutcome::ShutDown));
                return;
            }
            WatchExit::Fatal(e) => {
                let _ = events_tx.send(ControllerMsg::CampaignEnded(CampaignOutcome::Fatal(e)));
                return;
            }
            WatchExit::Retry => {
                let _ = events_tx.send(ControllerMsg::CampaignEnded(CampaignOutcome::Retryable(
                    Error::LeadershipLost,
                )));
                if wait_or_shutdown(&mut backoff, &shutdown).await.is_err() {
                    let _ =
                        events_tx.send(ControllerMsg::CampaignEnded(CampaignOutcome::ShutDown));
                    return;
                }
            }
        }
    }
}

/// Sleeps for the next backoff delay, or returns early (`Err(())`) if the
/// shutdown signal fires first.
async fn wait_or_shutdown(
    backoff: &mut Backoff,
    shutdown: &CancellationToken,
) -> std::result::Result<(), ()> {
    tokio::select! {
        _ = shutdown.cancelled() => Err(()),
        _ = tokio::time::sleep(backoff.next()) => Ok(()),
    }
}
