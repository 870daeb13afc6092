//! Namespace opening and the process-wide store registry.
//!
//! A logical database is a directory holding four separately-opened redb
//! databases, one per namespace. Sequence keys are a `u64`-typed table, so
//! the string sentinel counters live in a sibling `meta` table inside the
//! by-sequence database and can never collide with data keys.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use redb::{Database, ReadableTable, TableDefinition};

use davenport_core::{Error, OpenOptions, Result};

// Namespace files under the database directory.
pub(crate) const DOC_STORE_FILE: &str = "document-store";
pub(crate) const BY_SEQ_FILE: &str = "by-sequence";
pub(crate) const ATTACH_META_FILE: &str = "attach-store";
pub(crate) const ATTACH_BLOB_FILE: &str = "attach-binary-store";

/// docId → JSON-encoded `DocMeta`.
pub(crate) const DOC_STORE: TableDefinition<&str, &[u8]> = TableDefinition::new("document-store");
/// seq → JSON-encoded document body.
pub(crate) const BY_SEQ: TableDefinition<u64, &[u8]> = TableDefinition::new("by-sequence");
/// Sentinel counters, beside the sequence table.
pub(crate) const SEQ_META: TableDefinition<&str, u64> = TableDefinition::new("meta");
/// digest → JSON-encoded reference set.
pub(crate) const ATTACH_META: TableDefinition<&str, &[u8]> = TableDefinition::new("attach-store");
/// digest → raw attachment bytes.
pub(crate) const ATTACH_BLOB: TableDefinition<&str, &[u8]> =
    TableDefinition::new("attach-binary-store");

pub(crate) const LAST_UPDATE_SEQ_KEY: &str = "_local_last_update_seq";
pub(crate) const DOC_COUNT_KEY: &str = "_local_doc_count";

// ---------------------------------------------------------------------------
// Shared per-database state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub doc_count: u64,
    pub update_seq: u64,
}

#[derive(Debug)]
pub(crate) struct Namespaces {
    pub doc_store: Database,
    pub by_seq: Database,
    pub attach_meta: Database,
    pub attach_blob: Database,
}

#[derive(Debug)]
pub(crate) struct LdbInner {
    pub name: String,
    pub path: PathBuf,
    pub stores: Namespaces,
    /// Guards the read-modify-write counter pair and serializes bulk
    /// writes: one logical writer per handle.
    pub counters: tokio::sync::Mutex<Counters>,
    pub closed: AtomicBool,
}

impl LdbInner {
    pub fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotOpen);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Process-wide registry: at most one open handle per directory path
// ---------------------------------------------------------------------------

static STORES: OnceLock<StdMutex<HashMap<PathBuf, Arc<LdbInner>>>> = OnceLock::new();

fn registry() -> &'static StdMutex<HashMap<PathBuf, Arc<LdbInner>>> {
    STORES.get_or_init(Default::default)
}

/// Open (or reuse) the four namespaces for `<root>/<name>`.
///
/// Nothing is registered until every namespace opened and the counters
/// loaded, so a partial open never leaks into the registry.
pub(crate) fn open(root: &Path, name: &str, opts: &OpenOptions) -> Result<Arc<LdbInner>> {
    let dir = root.join(name);
    if !dir.is_dir() {
        if !opts.create_if_missing {
            return Err(Error::missing(format!("no such database: {name}")));
        }
        fs::create_dir_all(&dir)?;
    }
    let canonical = dir.canonicalize()?;

    let mut stores = registry().lock().expect("stores registry poisoned");
    if let Some(inner) = stores.get(&canonical) {
        return Ok(Arc::clone(inner));
    }

    let namespaces = Namespaces {
        doc_store: open_namespace(&canonical.join(DOC_STORE_FILE), |txn| {
            txn.open_table(DOC_STORE).map(drop)
        })?,
        by_seq: open_namespace(&canonical.join(BY_SEQ_FILE), |txn| {
            txn.open_table(BY_SEQ)?;
            txn.open_table(SEQ_META).map(drop)
        })?,
        attach_meta: open_namespace(&canonical.join(ATTACH_META_FILE), |txn| {
            txn.open_table(ATTACH_META).map(drop)
        })?,
        attach_blob: open_namespace(&canonical.join(ATTACH_BLOB_FILE), |txn| {
            txn.open_table(ATTACH_BLOB).map(drop)
        })?,
    };

    let counters = Counters {
        doc_count: meta_get(&namespaces.by_seq, DOC_COUNT_KEY)?.unwrap_or(0),
        update_seq: meta_get(&namespaces.by_seq, LAST_UPDATE_SEQ_KEY)?.unwrap_or(0),
    };

    let inner = Arc::new(LdbInner {
        name: name.to_string(),
        path: canonical.clone(),
        stores: namespaces,
        counters: tokio::sync::Mutex::new(counters),
        closed: AtomicBool::new(false),
    });
    stores.insert(canonical, Arc::clone(&inner));
    Ok(inner)
}

/// Open one redb database and make sure its tables exist, so later read
/// transactions never see an undefined table.
fn open_namespace(
    path: &Path,
    init: impl FnOnce(&redb::WriteTransaction) -> std::result::Result<(), redb::TableError>,
) -> Result<Database> {
    let db = Database::create(path).map_err(Error::storage)?;
    let txn = db.begin_write().map_err(Error::storage)?;
    init(&txn).map_err(Error::storage)?;
    txn.commit().map_err(Error::storage)?;
    Ok(db)
}

/// Close a handle: drop it from the registry so the path can be reopened.
pub(crate) fn close(inner: &LdbInner) -> Result<()> {
    if inner.closed.swap(true, Ordering::SeqCst) {
        return Err(Error::NotOpen);
    }
    registry()
        .lock()
        .expect("stores registry poisoned")
        .remove(&inner.path);
    Ok(())
}

/// Close (if open) and recursively delete `<root>/<name>`.
pub(crate) fn destroy(root: &Path, name: &str) -> Result<()> {
    let dir = root.join(name);
    if let Ok(canonical) = dir.canonicalize()
        && let Some(inner) = registry()
            .lock()
            .expect("stores registry poisoned")
            .remove(&canonical)
    {
        inner.closed.store(true, Ordering::SeqCst);
    }
    if !dir.is_dir() {
        return Err(Error::missing(format!("no such database: {name}")));
    }
    fs::remove_dir_all(&dir)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Single-key helpers — one short transaction per call
// ---------------------------------------------------------------------------

pub(crate) fn kv_put(
    db: &Database,
    table: TableDefinition<&str, &[u8]>,
    key: &str,
    value: &[u8],
) -> Result<()> {
    let txn = db.begin_write().map_err(Error::storage)?;
    {
        let mut t = txn.open_table(table).map_err(Error::storage)?;
        t.insert(key, value).map_err(Error::storage)?;
    }
    txn.commit().map_err(Error::storage)
}

pub(crate) fn kv_get(
    db: &Database,
    table: TableDefinition<&str, &[u8]>,
    key: &str,
) -> Result<Option<Vec<u8>>> {
    let txn = db.begin_read().map_err(Error::storage)?;
    let t = txn.open_table(table).map_err(Error::storage)?;
    Ok(t.get(key).map_err(Error::storage)?.map(|v| v.value().to_vec()))
}

pub(crate) fn seq_put(db: &Database, seq: u64, value: &[u8]) -> Result<()> {
    let txn = db.begin_write().map_err(Error::storage)?;
    {
        let mut t = txn.open_table(BY_SEQ).map_err(Error::storage)?;
        t.insert(seq, value).map_err(Error::storage)?;
    }
    txn.commit().map_err(Error::storage)
}

pub(crate) fn seq_get(db: &Database, seq: u64) -> Result<Option<Vec<u8>>> {
    let txn = db.begin_read().map_err(Error::storage)?;
    let t = txn.open_table(BY_SEQ).map_err(Error::storage)?;
    Ok(t.get(seq).map_err(Error::storage)?.map(|v| v.value().to_vec()))
}

pub(crate) fn seq_del(db: &Database, seq: u64) -> Result<()> {
    let txn = db.begin_write().map_err(Error::storage)?;
    {
        let mut t = txn.open_table(BY_SEQ).map_err(Error::storage)?;
        t.remove(seq).map_err(Error::storage)?;
    }
    txn.commit().map_err(Error::storage)
}

pub(crate) fn meta_put(db: &Database, key: &str, value: u64) -> Result<()> {
    let txn = db.begin_write().map_err(Error::storage)?;
    {
        let mut t = txn.open_table(SEQ_META).map_err(Error::storage)?;
        t.insert(key, value).map_err(Error::storage)?;
    }
    txn.commit().map_err(Error::storage)
}

pub(crate) fn meta_get(db: &Database, key: &str) -> Result<Option<u64>> {
    let txn = db.begin_read().map_err(Error::storage)?;
    let t = txn.open_table(SEQ_META).map_err(Error::storage)?;
    Ok(t.get(key).map_err(Error::storage)?.map(|v| v.value()))
}
