//! Shared helpers for adapter integration tests. Every test gets its own
//! temporary directory; keep the returned `TempDir` alive for the test's
//! duration or the database files disappear underneath the adapter.

use davenport_adapter_ldb::LdbAdapter;
use davenport_core::{BulkDocsOptions, OpenOptions};
use tempfile::TempDir;

pub fn fresh_db(name: &str) -> (TempDir, LdbAdapter) {
    let dir = tempfile::tempdir().unwrap();
    let db = LdbAdapter::open(dir.path(), name, OpenOptions::default()).unwrap();
    (dir, db)
}

/// Write one document (insert, update, or tombstone depending on the
/// `_rev`/`_deleted` fields it carries) and return the resulting rev.
pub async fn put(db: &LdbAdapter, doc: serde_json::Value) -> String {
    let results = db
        .bulk_docs(vec![doc], BulkDocsOptions::new())
        .await
        .unwrap();
    assert!(results[0].ok, "write failed: {:?}", results[0]);
    results[0].rev.clone().unwrap()
}
