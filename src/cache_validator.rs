use sha2::{Digest, Sha256};

use crate::models::StructureCacheEntry;

/// Integrity checks for persisted structure snapshots.
///
/// A snapshot is written with a SHA-256 checksum of its folders and accounts
/// payload. On read the checksum is recomputed; a mismatch means the row was
/// edited or corrupted outside this service and the snapshot is rebuilt from
/// the remote API instead of being served.
///
/// `serde_json::Value` keeps object keys sorted, so the serialized form is
/// stable across a JSONB round trip.
pub fn snapshot_checksum(folders: &serde_json::Value, accounts: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(folders.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(accounts.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Returns true when the stored checksum matches the stored payload.
pub fn is_valid(entry: &StructureCacheEntry) -> bool {
    let computed = snapshot_checksum(&entry.folders, &entry.accounts);
    if computed != entry.checksum {
        tracing::warn!(
            "Structure snapshot for manager {} failed validation: checksum mismatch",
            entry.manager_account_id
        );
        return false;
    }
    true
}
