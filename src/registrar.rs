use crate::error::Result;
use crate::store::{create_if_absent_txn, txn_get_kv, EtcdStore};

/// The outcome of a successful campaign registration: the candidate key and
/// the revision the watch loop must begin consuming from (inclusive of this
/// key's own creation).
#[derive(Debug, Clone)]
pub struct RegisterOutcome {
    pub key: String,
    pub revision: i64,
}

/// Composes `key = prefix + hex(leaseID)` and conditionally claims it.
///
/// `prefix` is expected to already include the trailing `/elections/<name>/`
/// path; `hex(lease_id)` makes the key deterministic per lease, which is what
/// makes the "key already exists" branch below meaningful and lets
/// withdrawal reuse the same encoding.
pub fn candidate_key(election_prefix: &str, lease_id: i64) -> String {
    format!("{election_prefix}{lease_id:016x}")
}

/// Writes the candidate key under the election prefix, bound to `lease_id`,
/// via a conditional create (`if CreateRevision(key) == 0 then Put else Get`).
///
/// If the get branch fires and the existing value differs from `candidate`
/// — a "shouldn't happen" case where the store already has a key under our
/// lease ID — the existing key is overwritten with a plain put to assume
/// ownership. This is preserved verbatim from the system this core is
/// modeled on even though the resulting key's create-revision may still
/// belong to the prior write, which can skew leader ordering; see
/// DESIGN.md's open-question ledger (OQ1).
pub async fn register(
    store: &EtcdStore,
    election_prefix: &str,
    lease_id: i64,
    candidate: &str,
) -> Result<RegisterOutcome> {
    let key = candidate_key(election_prefix, lease_id);
    let txn = create_if_absent_txn(&key, candidate.as_bytes().to_vec(), lease_id);
    let resp = store.txn(txn).await?;

    if resp.succeeded() {
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        return Ok(RegisterOutcome { key, revision });
    }

    let (existing_value, existing_revision) = match txn_get_kv(&resp) {
        Some((_, value, revision)) => (value, revision),
        None => (Vec::new(), 0),
    };

    if existing_value == candidate.as_bytes() {
        return Ok(RegisterOutcome {
            key,
            revision: existing_revision,
        });
    }

    store
        .put_raw(&key, candidate.as_bytes().to_vec(), Some(lease_id))
        .await?;
    Ok(RegisterOutcome {
        key,
        revision: existing_revision,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_key_is_hex_encoded_and_deterministic() {
        let key = candidate_key("/elections/presidental/", 0x2a);
        assert_eq!(key, "/elections/presidental/000000000000002a");
        assert_eq!(key, candidate_key("/elections/presidental/", 42));
    }

    #[test]
    fn candidate_key_varies_with_lease() {
        let a = candidate_key("/elections/presidental/", 1);
        let b = candidate_key("/elections/presidental/", 2);
        assert_ne!(a, b);
    }
}
