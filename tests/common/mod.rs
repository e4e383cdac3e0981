use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use etcd_election::{Election, ElectionConfig, EtcdStore, StoreConfig};

pub const ETCD_ENDPOINT: &str = "http://localhost:2379";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

static LOGGING: Once = Once::new();

/// Installs a `tracing` subscriber the first time it's called; later calls
/// (one per test function) are no-ops. `RUST_LOG` controls verbosity, same
/// as the binaries' own `tracing_subscriber::fmt()` setup.
fn init_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::Level::INFO.into())
                    .from_env_lossy(),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A store rooted at a fresh, uuid-namespaced prefix so concurrent test runs
/// never collide on the same keys.
pub async fn test_store(test_name: &str) -> Arc<EtcdStore> {
    init_logging();
    let prefix = format!("/test-{}-{}/", test_name, uuid::Uuid::new_v4());
    let config = StoreConfig {
        endpoints: vec![ETCD_ENDPOINT.to_string()],
        prefix,
    };
    Arc::new(
        EtcdStore::connect(config)
            .await
            .expect("failed to connect to etcd"),
    )
}

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

/// Starts a candidate, blocking (bounded by `WAIT_TIMEOUT`) until its first
/// event has been dispatched, same as `Election::new`'s own construction
/// contract.
pub async fn start_candidate(
    store: Arc<EtcdStore>,
    election: &str,
    candidate: &str,
    ttl_secs: i64,
) -> Election {
    let config = ElectionConfig::new(election)
        .with_candidate(candidate)
        .with_ttl_secs(ttl_secs);
    tokio::time::timeout(WAIT_TIMEOUT, Election::new(store, config))
        .await
        .expect("election construction timed out")
        .expect("election construction failed")
}
