//! The bulk write pipeline.
//!
//! `bulk_docs` parses the whole batch up front, coalesces duplicate ids,
//! then lands one document at a time: merge into the existing revision
//! tree, ingest attachments, allocate a sequence, write the body, the
//! metadata, and the sentinel in that order, and publish the change event.
//! Per-document failures are collected; only a parse failure aborts the
//! batch.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest, Md5};
use serde_json::{Map, Value, json};

use davenport_core::document::{BulkDocsOptions, ChangeEvent, ChangeRev, DocResult, Revision};
use davenport_core::error::{Error, Result};
use davenport_core::merge::{self, MergeKind};
use davenport_core::parse::{ParsedDoc, is_local_id, parse_doc};
use davenport_core::rev_tree::collect_leaves;

use crate::adapter::LdbAdapter;
use crate::changes::emitter;
use crate::store::{self, Counters, DOC_COUNT_KEY, DOC_STORE, LAST_UPDATE_SEQ_KEY};

/// Revision trees are stemmed to this many generations per branch.
const REV_TREE_DEPTH: u64 = 1000;

struct DocWrite {
    bulk_seq: usize,
    doc: ParsedDoc,
}

impl LdbAdapter {
    pub async fn bulk_docs(&self, docs: Vec<Value>, opts: BulkDocsOptions) -> Result<Vec<DocResult>> {
        self.inner.ensure_open()?;

        // Phase 1: parse everything; the first bad document fails the batch.
        let mut parsed = Vec::with_capacity(docs.len());
        for (bulk_seq, raw) in docs.into_iter().enumerate() {
            parsed.push(DocWrite {
                bulk_seq,
                doc: parse_doc(raw, opts.new_edits)?,
            });
        }

        // Phase 2: coalesce duplicate ids. Under new_edits two edits of the
        // same document in one batch cannot both apply; the later one is a
        // conflict before any work happens.
        let mut results: Vec<Option<DocResult>> = parsed.iter().map(|_| None).collect();
        let mut stack: Vec<DocWrite> = Vec::with_capacity(parsed.len());
        for write in parsed {
            let duplicate = opts.new_edits
                && stack
                    .last()
                    .is_some_and(|prev| prev.doc.meta.id == write.doc.meta.id);
            if duplicate {
                results[write.bulk_seq] =
                    Some(DocResult::err(&write.doc.meta.id, &Error::RevConflict));
            } else {
                stack.push(write);
            }
        }

        // One logical writer per handle: the counter lock serializes
        // overlapping bulk_docs calls for the database.
        let mut counters = self.inner.counters.lock().await;

        // Phase 3: land documents one at a time.
        while let Some(DocWrite { bulk_seq, mut doc }) = stack.pop() {
            let id = doc.meta.id.clone();
            let outcome = match self.process_doc(&mut doc, &opts, &mut counters) {
                Ok(rev) => DocResult::ok(&id, rev.to_string()),
                Err(err) => DocResult::err(&id, &err),
            };
            if outcome.ok && !is_local_id(&id) {
                self.publish_change(&doc);
            }
            results[bulk_seq] = Some(outcome);
        }
        drop(counters);

        Ok(results
            .into_iter()
            .map(|row| row.expect("every input produced a result"))
            .collect())
    }

    /// Insert or update one document; returns the winning revision after
    /// the write.
    fn process_doc(
        &self,
        doc: &mut ParsedDoc,
        opts: &BulkDocsOptions,
        counters: &mut Counters,
    ) -> Result<Revision> {
        match self.fetch_meta(&doc.meta.id)? {
            None => {
                // Deleting a document that does not exist is not an insert.
                if opts.was_delete && doc.meta.deleted {
                    return Err(Error::missing("deleted"));
                }
                self.write_doc(doc, counters)?;
                if !is_local_id(&doc.meta.id) {
                    counters.doc_count += 1;
                    store::meta_put(&self.inner.stores.by_seq, DOC_COUNT_KEY, counters.doc_count)?;
                }
            }
            Some(old) => {
                let old_deleted = merge::is_deleted(&old.rev_tree);
                let merged = merge::merge(&old.rev_tree, &doc.meta.rev_tree[0], REV_TREE_DEPTH);
                let conflict = (old_deleted && doc.meta.deleted)
                    || (opts.new_edits && !old_deleted && merged.kind != MergeKind::NewLeaf);
                if conflict {
                    return Err(Error::RevConflict);
                }
                doc.meta.rev_tree = merged.tree;
                doc.meta.rev_map = old.rev_map;
                self.write_doc(doc, counters)?;
            }
        }
        merge::winning_rev(&doc.meta.rev_tree).ok_or_else(|| Error::missing("missing"))
    }

    /// Phase 4: attachments settle first, then the sequence is allocated
    /// and body, metadata, and the update_seq sentinel land in that order.
    fn write_doc(&self, doc: &mut ParsedDoc, counters: &mut Counters) -> Result<()> {
        let deleted = merge::is_deleted(&doc.meta.rev_tree);
        doc.meta.deleted = deleted;
        doc.body.insert("_id".into(), json!(doc.meta.id));
        if deleted {
            doc.body.insert("_deleted".into(), json!(true));
        } else {
            doc.body.remove("_deleted");
        }

        self.ingest_attachments(&doc.meta.id, &doc.meta.rev, &mut doc.body)?;

        counters.update_seq += 1;
        if doc.meta.seq == 0 {
            doc.meta.seq = counters.update_seq;
        }
        doc.meta
            .rev_map
            .insert(doc.meta.rev.to_string(), doc.meta.seq);

        let body_bytes = serde_json::to_vec(&doc.body)?;
        store::seq_put(&self.inner.stores.by_seq, doc.meta.seq, &body_bytes)?;
        store::kv_put(
            &self.inner.stores.doc_store,
            DOC_STORE,
            &doc.meta.id,
            &serde_json::to_vec(&doc.meta)?,
        )?;
        store::meta_put(
            &self.inner.stores.by_seq,
            LAST_UPDATE_SEQ_KEY,
            counters.update_seq,
        )?;
        Ok(())
    }

    /// Phase 5: store every non-stub attachment under its content digest
    /// and rewrite the body entry as a stub. An attachment failure
    /// abandons this document only.
    fn ingest_attachments(
        &self,
        doc_id: &str,
        rev: &Revision,
        body: &mut Map<String, Value>,
    ) -> Result<()> {
        let Some(Value::Object(attachments)) = body.get_mut("_attachments") else {
            return Ok(());
        };
        for (name, entry) in attachments.iter_mut() {
            if entry.get("stub").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            let bytes = match entry.get("data") {
                Some(Value::String(b64)) => BASE64.decode(b64).map_err(|_| {
                    Error::BadRequest(format!("attachment {name} is not valid base64"))
                })?,
                None | Some(Value::Null) => Vec::new(),
                Some(_) => {
                    return Err(Error::BadRequest(format!(
                        "attachment {name} data must be a base64 string"
                    )));
                }
            };
            let digest = format!("md5-{:x}", Md5::digest(&bytes));
            self.save_attachment(doc_id, rev, &digest, &bytes)?;

            let mut stub = Map::new();
            if let Some(content_type) = entry.get("content_type") {
                stub.insert("content_type".into(), content_type.clone());
            }
            stub.insert("digest".into(), json!(digest));
            stub.insert("length".into(), json!(bytes.len()));
            stub.insert("stub".into(), json!(true));
            *entry = Value::Object(stub);
        }
        Ok(())
    }

    /// Reference-count one attachment under `"<docId>@<rev>"`. Rows
    /// predating reference tracking (no `refs` field) are written back
    /// unmodified rather than migrated. Zero-length payloads get a digest
    /// row but no blob row.
    fn save_attachment(
        &self,
        doc_id: &str,
        rev: &Revision,
        digest: &str,
        bytes: &[u8],
    ) -> Result<()> {
        let ref_key = format!("{doc_id}@{rev}");
        let row = match store::kv_get(&self.inner.stores.attach_meta, store::ATTACH_META, digest)? {
            Some(existing) => {
                let mut row: Value = serde_json::from_slice(&existing)?;
                if let Some(Value::Object(refs)) = row.get_mut("refs") {
                    refs.insert(ref_key, json!(true));
                }
                row
            }
            None => json!({ "refs": { ref_key: true } }),
        };
        store::kv_put(
            &self.inner.stores.attach_meta,
            store::ATTACH_META,
            digest,
            &serde_json::to_vec(&row)?,
        )?;
        if !bytes.is_empty() {
            store::kv_put(&self.inner.stores.attach_blob, store::ATTACH_BLOB, digest, bytes)?;
        }
        Ok(())
    }

    /// Phase 6: after the document is durable, tell live subscribers.
    ///
    /// Same rule as the one-shot scan: a sequence is announced only when
    /// it holds the winning revision. A replicated branch that loses the
    /// winner comparison gets a seq and a body but no event; its body must
    /// not go out stamped with another revision's id.
    fn publish_change(&self, doc: &ParsedDoc) {
        let Some(winning) = merge::winning_rev(&doc.meta.rev_tree) else {
            return;
        };
        if doc.meta.rev_map.get(&winning.to_string()) != Some(&doc.meta.seq) {
            return;
        }
        let mut body = doc.body.clone();
        body.insert("_rev".into(), json!(winning.to_string()));
        let event = ChangeEvent {
            seq: doc.meta.seq,
            id: doc.meta.id.clone(),
            changes: collect_leaves(&doc.meta.rev_tree)
                .iter()
                .map(|leaf| ChangeRev {
                    rev: leaf.rev().to_string(),
                })
                .collect(),
            deleted: doc.meta.deleted,
            doc: Some(Value::Object(body)),
        };
        // No subscribers is fine.
        let _ = emitter(&self.inner.name).send(event);
    }
}
