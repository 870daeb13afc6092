use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use redb::ReadableTable;
use serde_json::{Map, Value, json};

use davenport_core::adapter::Adapter;
use davenport_core::document::{
    AllDocsOptions, AllDocsResponse, AllDocsRow, AllDocsRowValue, BulkDocsOptions, ChangesOptions,
    ChangesResponse, DbInfo, DocMeta, DocResult, GetAttachmentOptions, GetOptions, OpenOptions,
    Revision,
};
use davenport_core::error::{Error, Result};
use davenport_core::merge;
use davenport_core::parse::is_local_id;
use davenport_core::rev_tree::RevTree;

use crate::store::{self, DOC_STORE, LdbInner};

/// Names this adapter registers under with the database facade.
pub const ADAPTER_NAMES: [&str; 2] = ["ldb", "leveldb"];

fn range_bound(key: Option<&str>, inclusive: bool) -> std::ops::Bound<&str> {
    match key {
        None => std::ops::Bound::Unbounded,
        Some(key) if inclusive => std::ops::Bound::Included(key),
        Some(key) => std::ops::Bound::Excluded(key),
    }
}

/// Persistent local adapter: documents with revision trees in a document
/// store, bodies in an append-only by-sequence log, content-addressed
/// attachments, and a live change feed.
///
/// Cloning the handle is cheap; all clones share one underlying database.
#[derive(Clone)]
#[derive(Debug)]
pub struct LdbAdapter {
    pub(crate) inner: Arc<LdbInner>,
}

impl LdbAdapter {
    /// Open `<root>/<name>`, creating it if allowed. Reopening a path that
    /// is already open returns the registered handle.
    pub fn open(root: impl AsRef<Path>, name: &str, opts: OpenOptions) -> Result<Self> {
        Ok(Self {
            inner: store::open(root.as_ref(), name, &opts)?,
        })
    }

    /// Close (if open) and recursively remove `<root>/<name>`.
    pub fn destroy(root: impl AsRef<Path>, name: &str) -> Result<()> {
        store::destroy(root.as_ref(), name)
    }

    pub fn kind(&self) -> &'static str {
        "leveldb"
    }

    pub fn id(&self) -> &str {
        &self.inner.name
    }

    pub async fn info(&self) -> Result<DbInfo> {
        self.inner.ensure_open()?;
        let counters = *self.inner.counters.lock().await;
        Ok(DbInfo {
            db_name: self.inner.name.clone(),
            doc_count: counters.doc_count,
            update_seq: counters.update_seq,
        })
    }

    // -- read path ----------------------------------------------------------

    pub async fn get(&self, doc_id: &str, opts: GetOptions) -> Result<Value> {
        self.inner.ensure_open()?;
        let meta = self
            .fetch_meta(doc_id)?
            .ok_or_else(|| Error::missing("missing"))?;
        let winning =
            merge::winning_rev(&meta.rev_tree).ok_or_else(|| Error::missing("missing"))?;

        let rev = match &opts.rev {
            Some(requested) => requested.parse::<Revision>()?,
            None => {
                if merge::is_deleted(&meta.rev_tree) {
                    return Err(Error::missing("deleted"));
                }
                winning
            }
        };

        let seq = *meta
            .rev_map
            .get(&rev.to_string())
            .ok_or_else(|| Error::missing("missing"))?;
        let mut body = self
            .fetch_body(seq)?
            .ok_or_else(|| Error::missing("missing"))?;

        body.insert("_id".into(), json!(doc_id));
        body.insert("_rev".into(), json!(rev.to_string()));

        if opts.conflicts {
            let conflicts: Vec<String> = merge::collect_conflicts(&meta.rev_tree)
                .iter()
                .map(Revision::to_string)
                .collect();
            if !conflicts.is_empty() {
                body.insert("_conflicts".into(), json!(conflicts));
            }
        }

        if opts.attachments {
            self.inline_attachments(&mut body)?;
        }

        Ok(Value::Object(body))
    }

    /// Replace attachment stubs with inline base64 data.
    fn inline_attachments(&self, body: &mut Map<String, Value>) -> Result<()> {
        let Some(Value::Object(attachments)) = body.get_mut("_attachments") else {
            return Ok(());
        };
        for entry in attachments.values_mut() {
            let digest = entry
                .get("digest")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::missing("missing"))?;
            // No blob row under a known digest means a zero-length blob.
            let bytes = store::kv_get(
                &self.inner.stores.attach_blob,
                store::ATTACH_BLOB,
                digest,
            )?
            .unwrap_or_default();
            if let Value::Object(entry) = entry {
                entry.insert("data".into(), json!(BASE64.encode(&bytes)));
                entry.remove("stub");
            }
        }
        Ok(())
    }

    pub async fn get_attachment(
        &self,
        doc_id: &str,
        name: &str,
        opts: GetAttachmentOptions,
    ) -> Result<Vec<u8>> {
        self.inner.ensure_open()?;
        let meta = self
            .fetch_meta(doc_id)?
            .ok_or_else(|| Error::missing("missing"))?;
        let rev = match &opts.rev {
            Some(requested) => requested.parse::<Revision>()?,
            None => merge::winning_rev(&meta.rev_tree).ok_or_else(|| Error::missing("missing"))?,
        };
        let seq = *meta
            .rev_map
            .get(&rev.to_string())
            .ok_or_else(|| Error::missing("missing"))?;
        let body = self
            .fetch_body(seq)?
            .ok_or_else(|| Error::missing("missing"))?;

        let digest = body
            .get("_attachments")
            .and_then(|a| a.get(name))
            .and_then(|a| a.get("digest"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::missing("missing attachment"))?;

        let bytes = store::kv_get(&self.inner.stores.attach_blob, store::ATTACH_BLOB, digest)?
            .unwrap_or_default();
        if opts.encode {
            Ok(BASE64.encode(&bytes).into_bytes())
        } else {
            Ok(bytes)
        }
    }

    pub async fn all_docs(&self, opts: AllDocsOptions) -> Result<AllDocsResponse> {
        self.inner.ensure_open()?;

        let keys = opts
            .keys
            .clone()
            .or_else(|| opts.key.clone().map(|k| vec![k]));
        let mut rows = match keys {
            Some(keys) => self.all_docs_by_keys(keys, &opts)?,
            None => self.all_docs_by_range(&opts)?,
        };

        if opts.skip > 0 {
            rows.drain(..rows.len().min(opts.skip as usize));
        }
        if let Some(limit) = opts.limit {
            rows.truncate(limit as usize);
        }

        Ok(AllDocsResponse {
            total_rows: rows.len() as u64,
            offset: opts.skip,
            rows,
        })
    }

    /// Explicit key list: rows follow the list order (reversed when
    /// descending); deleted and missing keys are reported per key.
    fn all_docs_by_keys(&self, mut keys: Vec<String>, opts: &AllDocsOptions) -> Result<Vec<AllDocsRow>> {
        if opts.descending {
            keys.reverse();
        }
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            if is_local_id(&key) {
                continue;
            }
            let row = match self.fetch_meta(&key)? {
                None => AllDocsRow {
                    id: None,
                    key,
                    value: None,
                    doc: None,
                    error: Some("not_found".into()),
                },
                Some(meta) => {
                    let Some(winning) = merge::winning_rev(&meta.rev_tree) else {
                        continue;
                    };
                    if merge::is_deleted(&meta.rev_tree) {
                        AllDocsRow {
                            id: Some(meta.id.clone()),
                            key,
                            value: Some(AllDocsRowValue {
                                rev: winning.to_string(),
                                deleted: Some(true),
                            }),
                            doc: None,
                            error: None,
                        }
                    } else {
                        self.doc_row(&meta, &winning, opts)?
                    }
                }
            };
            rows.push(row);
        }
        Ok(rows)
    }

    fn all_docs_by_range(&self, opts: &AllDocsOptions) -> Result<Vec<AllDocsRow>> {
        // When descending, start_key is the upper bound; inclusive_end
        // follows end_key to whichever side it lands on.
        let (lower, upper) = if opts.descending {
            (
                range_bound(opts.end_key.as_deref(), opts.inclusive_end),
                range_bound(opts.start_key.as_deref(), true),
            )
        } else {
            (
                range_bound(opts.start_key.as_deref(), true),
                range_bound(opts.end_key.as_deref(), opts.inclusive_end),
            )
        };

        let txn = self
            .inner
            .stores
            .doc_store
            .begin_read()
            .map_err(Error::storage)?;
        let table = txn.open_table(DOC_STORE).map_err(Error::storage)?;
        let range = table.range::<&str>((lower, upper)).map_err(Error::storage)?;

        let mut rows = Vec::new();
        let entries: Box<dyn Iterator<Item = _> + '_> = if opts.descending {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };
        for entry in entries {
            let (key, value) = entry.map_err(Error::storage)?;
            let id = key.value().to_string();
            if is_local_id(&id) {
                continue;
            }
            let meta: DocMeta = serde_json::from_slice(value.value())?;
            let Some(winning) = merge::winning_rev(&meta.rev_tree) else {
                continue;
            };
            if merge::is_deleted(&meta.rev_tree) {
                continue;
            }
            rows.push(self.doc_row(&meta, &winning, opts)?);
        }
        Ok(rows)
    }

    fn doc_row(&self, meta: &DocMeta, winning: &Revision, opts: &AllDocsOptions) -> Result<AllDocsRow> {
        let doc = if opts.include_docs {
            let seq = *meta
                .rev_map
                .get(&winning.to_string())
                .ok_or_else(|| Error::missing("missing"))?;
            let mut body = self
                .fetch_body(seq)?
                .ok_or_else(|| Error::missing("missing"))?;
            body.insert("_rev".into(), json!(winning.to_string()));
            if opts.conflicts {
                let conflicts: Vec<String> = merge::collect_conflicts(&meta.rev_tree)
                    .iter()
                    .map(Revision::to_string)
                    .collect();
                if !conflicts.is_empty() {
                    body.insert("_conflicts".into(), json!(conflicts));
                }
            }
            Some(Value::Object(body))
        } else {
            None
        };
        Ok(AllDocsRow {
            id: Some(meta.id.clone()),
            key: meta.id.clone(),
            value: Some(AllDocsRowValue {
                rev: winning.to_string(),
                deleted: None,
            }),
            doc,
            error: None,
        })
    }

    pub async fn get_revision_tree(&self, doc_id: &str) -> Result<RevTree> {
        self.inner.ensure_open()?;
        let meta = self
            .fetch_meta(doc_id)?
            .ok_or_else(|| Error::missing("missing"))?;
        Ok(meta.rev_tree)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Drop the stored bodies of the given revisions. Metadata and
    /// attachment references are the compaction caller's responsibility.
    pub async fn remove_doc_revisions(&self, doc_id: &str, revs: &[Revision]) -> Result<()> {
        self.inner.ensure_open()?;
        if revs.is_empty() {
            return Ok(());
        }
        let meta = self
            .fetch_meta(doc_id)?
            .ok_or_else(|| Error::missing("missing"))?;
        for rev in revs {
            if let Some(&seq) = meta.rev_map.get(&rev.to_string()) {
                store::seq_del(&self.inner.stores.by_seq, seq)?;
            }
        }
        Ok(())
    }

    /// Reference set for an attachment digest, if one was ever stored.
    /// Compaction uses this to decide when a blob is orphaned.
    pub async fn attachment_refs(&self, digest: &str) -> Result<Option<Value>> {
        self.inner.ensure_open()?;
        store::kv_get(&self.inner.stores.attach_meta, store::ATTACH_META, digest)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(Error::from))
            .transpose()
    }

    /// Deregister this database. The underlying stores shut down once the
    /// last clone of the handle is dropped; the path can then be reopened.
    pub async fn close(&self) -> Result<()> {
        store::close(&self.inner)
    }

    // -- shared lookups -----------------------------------------------------

    pub(crate) fn fetch_meta(&self, doc_id: &str) -> Result<Option<DocMeta>> {
        store::kv_get(&self.inner.stores.doc_store, DOC_STORE, doc_id)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(Error::from))
            .transpose()
    }

    pub(crate) fn fetch_body(&self, seq: u64) -> Result<Option<Map<String, Value>>> {
        store::seq_get(&self.inner.stores.by_seq, seq)?
            .map(|bytes| serde_json::from_slice(&bytes).map_err(Error::from))
            .transpose()
    }
}

#[async_trait]
impl Adapter for LdbAdapter {
    fn kind(&self) -> &'static str {
        LdbAdapter::kind(self)
    }

    fn id(&self) -> &str {
        LdbAdapter::id(self)
    }

    async fn info(&self) -> Result<DbInfo> {
        LdbAdapter::info(self).await
    }

    async fn get(&self, doc_id: &str, opts: GetOptions) -> Result<Value> {
        LdbAdapter::get(self, doc_id, opts).await
    }

    async fn get_attachment(
        &self,
        doc_id: &str,
        name: &str,
        opts: GetAttachmentOptions,
    ) -> Result<Vec<u8>> {
        LdbAdapter::get_attachment(self, doc_id, name, opts).await
    }

    async fn all_docs(&self, opts: AllDocsOptions) -> Result<AllDocsResponse> {
        LdbAdapter::all_docs(self, opts).await
    }

    async fn bulk_docs(&self, docs: Vec<Value>, opts: BulkDocsOptions) -> Result<Vec<DocResult>> {
        LdbAdapter::bulk_docs(self, docs, opts).await
    }

    async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse> {
        LdbAdapter::changes(self, opts).await
    }

    async fn get_revision_tree(&self, doc_id: &str) -> Result<RevTree> {
        LdbAdapter::get_revision_tree(self, doc_id).await
    }

    async fn remove_doc_revisions(&self, doc_id: &str, revs: &[Revision]) -> Result<()> {
        LdbAdapter::remove_doc_revisions(self, doc_id, revs).await
    }

    async fn close(&self) -> Result<()> {
        LdbAdapter::close(self).await
    }
}
