use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, GetOptions, LeaseKeepAliveStream, LeaseKeeper,
    PutOptions, SortOrder, SortTarget, Txn, TxnOp, TxnOpResponse, TxnResponse, WatchOptions,
    WatchStream, Watcher,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub endpoints: Vec<String>,
    /// Key prefix for all operations, e.g. `"/elections/presidental/"`.
    pub prefix: String,
}

/// Prefixed etcd client with typed JSON helpers plus the raw byte/revision
/// primitives the election core needs (conditional create, first-created
/// query, revision-bounded watch).
///
/// `Client` is `Clone` (wraps an inner `Arc`), so each method clones it
/// cheaply rather than requiring `&mut self`.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    config: StoreConfig,
}

impl EtcdStore {
    pub async fn connect(config: StoreConfig) -> Result<Self> {
        let client = Client::connect(&config.endpoints, None).await?;
        Ok(Self { client, config })
    }

    #[cfg(test)]
    pub fn from_client(client: Client, config: StoreConfig) -> Self {
        Self { client, config }
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    // ── JSON helpers ─────────────────────────────────────────────
    // Kept generic so callers layering typed metadata on top of a
    // candidate's plain-string election value have somewhere to put it.

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let resp = self.client.clone().get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(serde_json::from_slice(kv.value())?)),
            None => Ok(None),
        }
    }

    pub async fn list<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let options = GetOptions::new().with_prefix();
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        resp.kvs()
            .iter()
            .map(|kv| serde_json::from_slice(kv.value()).map_err(Error::from))
            .collect()
    }

    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        lease_id: Option<i64>,
    ) -> Result<()> {
        let value = serde_json::to_string(value)?;
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));
        self.client.clone().put(key, value, options).await?;
        Ok(())
    }

    // ── Raw byte primitives used by the election core ───────────

    /// Puts a plain byte value, returning the response header's revision.
    pub async fn put_raw(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        lease_id: Option<i64>,
    ) -> Result<i64> {
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));
        let resp = self.client.clone().put(key, value, options).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
    }

    /// Gets the prefix entry with the smallest create-revision — the
    /// "first-created" query the watch loop and registrar rely on.
    /// Returns `(key, value, create_revision)`.
    pub async fn get_first_created(&self, prefix: &str) -> Result<Option<(String, Vec<u8>, i64)>> {
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Create, SortOrder::Ascend)
            .with_limit(1);
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some((
                kv.key_str().unwrap_or_default().to_string(),
                kv.value().to_vec(),
                kv.create_revision(),
            ))),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client.clone().delete(key, None).await?;
        Ok(())
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let options = DeleteOptions::new().with_prefix();
        self.client.clone().delete(prefix, Some(options)).await?;
        Ok(())
    }

    /// Opens a watch on `prefix` starting at `start_revision` (inclusive).
    ///
    /// Returns the `Watcher` handle alongside the stream: `etcd-client`
    /// 0.18's `WatchOptions` has no `with_require_leader()` (etcd's
    /// `WatchCreateRequest` carries no such field at all — the Go client's
    /// `WithRequireLeader` works by attaching gRPC call metadata, which this
    /// crate doesn't expose a hook for). The caller uses the `Watcher` to
    /// send periodic `request_progress()` probes as a fail-fast substitute;
    /// see DESIGN.md's Open-Question ledger (OQ5).
    pub async fn watch(&self, prefix: &str, start_revision: i64) -> Result<(Watcher, WatchStream)> {
        let options = WatchOptions::new()
            .with_prefix()
            .with_start_revision(start_revision);
        let (watcher, stream) = self.client.clone().watch(prefix, Some(options)).await?;
        Ok((watcher, stream))
    }

    // ── Transactions ─────────────────────────────────────────────

    pub async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        Ok(self.client.clone().txn(txn).await?)
    }

    // ── Lease operations ─────────────────────────────────────────

    pub async fn grant_lease(&self, ttl: i64) -> Result<i64> {
        let resp = self.client.clone().lease_grant(ttl, None).await?;
        Ok(resp.id())
    }

    pub async fn keep_alive(&self, lease_id: i64) -> Result<(LeaseKeeper, LeaseKeepAliveStream)> {
        let (keeper, stream) = self.client.clone().lease_keep_alive(lease_id).await?;
        Ok((keeper, stream))
    }

    pub async fn revoke_lease(&self, lease_id: i64) -> Result<()> {
        self.client.clone().lease_revoke(lease_id).await?;
        Ok(())
    }

    // ── Cleanup ──────────────────────────────────────────────────

    pub async fn delete_all(&self) -> Result<()> {
        self.delete_prefix(&self.config.prefix).await
    }
}

/// Builds the `if CreateRevision(key) == 0 then Put else Get` transaction
/// the campaign registrar uses to conditionally claim a candidate key.
pub fn create_if_absent_txn(key: &str, value: impl Into<Vec<u8>>, lease_id: i64) -> Txn {
    Txn::new()
        .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
        .and_then(vec![TxnOp::put(
            key,
            value,
            Some(PutOptions::new().with_lease(lease_id)),
        )])
        .or_else(vec![TxnOp::get(key, None)])
}

/// Extracts the `Get` branch's first key-value out of a txn response, if any.
pub fn txn_get_kv(resp: &TxnResponse) -> Option<(Vec<u8>, Vec<u8>, i64)> {
    resp.op_responses().into_iter().find_map(|op| match op {
        TxnOpResponse::Get(get_resp) => get_resp
            .kvs()
            .first()
            .map(|kv| (kv.key().to_vec(), kv.value().to_vec(), kv.create_revision())),
        _ => None,
    })
}
