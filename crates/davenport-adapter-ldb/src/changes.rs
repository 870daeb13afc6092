//! Change feed: one-shot scans over the by-sequence log and a continuous
//! mode backed by a process-local broadcast emitter per database name.
//!
//! Emitters live for the whole process; store handles come and go around
//! them, so a subscriber opened before a close/reopen keeps working.

use std::collections::HashMap;
use std::sync::{Mutex as StdMutex, OnceLock};

use redb::ReadableTable;
use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use davenport_core::document::{
    ChangeEvent, ChangeRev, ChangesOptions, ChangesResponse, GetOptions, Revision,
};
use davenport_core::error::{Error, Result};
use davenport_core::filter::{ChangeFilter, selector_from_design};
use davenport_core::merge;
use davenport_core::parse::is_local_id;
use davenport_core::rev_tree::collect_leaves;

use crate::adapter::LdbAdapter;
use crate::store::BY_SEQ;

// ---------------------------------------------------------------------------
// Per-database-name emitter registry (process lifetime)
// ---------------------------------------------------------------------------

static CHANGES: OnceLock<StdMutex<HashMap<String, broadcast::Sender<ChangeEvent>>>> =
    OnceLock::new();

pub(crate) fn emitter(name: &str) -> broadcast::Sender<ChangeEvent> {
    let mut emitters = CHANGES
        .get_or_init(Default::default)
        .lock()
        .expect("changes registry poisoned");
    emitters
        .entry(name.to_string())
        .or_insert_with(|| broadcast::channel(256).0)
        .clone()
}

/// Cancellation handle for a continuous feed. Dropping it cancels too.
pub struct ChangesHandle {
    cancel: CancellationToken,
}

impl ChangesHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ChangesHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Feed implementation
// ---------------------------------------------------------------------------

impl LdbAdapter {
    /// One-shot change feed.
    pub async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse> {
        self.inner.ensure_open()?;
        let filter = self.resolve_filter(&opts).await?;
        self.scan_changes(&opts, &filter)
    }

    /// Continuous feed: drains existing changes, then forwards live events
    /// until the handle is cancelled or the receiver is dropped.
    pub fn live_changes(&self, opts: ChangesOptions) -> (mpsc::Receiver<ChangeEvent>, ChangesHandle) {
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let adapter = self.clone();

        tokio::spawn(async move {
            // Subscribe before draining so nothing lands in the gap; the
            // drain's last_seq then filters replayed deliveries.
            let mut sub = emitter(&adapter.inner.name).subscribe();

            let Ok(filter) = adapter.resolve_filter(&opts).await else {
                return;
            };
            let drain_opts = ChangesOptions {
                descending: false,
                ..opts.clone()
            };
            let Ok(drained) = adapter.scan_changes(&drain_opts, &filter) else {
                return;
            };

            let mut last_seq = drained.last_seq.max(opts.since);
            let mut delivered: u64 = 0;
            for event in drained.results {
                if tx.send(event).await.is_err() {
                    return;
                }
                delivered += 1;
            }
            if opts.limit.is_some_and(|limit| delivered >= limit) {
                return;
            }

            loop {
                tokio::select! {
                    // Cancellation beats a ready event.
                    biased;
                    _ = token.cancelled() => return,
                    received = sub.recv() => match received {
                        Ok(mut event) => {
                            if event.seq <= last_seq {
                                continue;
                            }
                            last_seq = event.seq;
                            if !filter.apply(&mut event) {
                                continue;
                            }
                            if tx.send(event).await.is_err() {
                                return;
                            }
                            delivered += 1;
                            if opts.limit.is_some_and(|limit| delivered >= limit) {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        });

        (rx, ChangesHandle { cancel })
    }

    /// Build the subscription filter, resolving a `"ddoc/name"` filter
    /// reference through the public `get`. Only selector objects are
    /// accepted; code is never evaluated.
    pub(crate) async fn resolve_filter(&self, opts: &ChangesOptions) -> Result<ChangeFilter> {
        let filter = ChangeFilter::from_options(opts);
        let Some(reference) = &opts.filter else {
            return Ok(filter);
        };
        let (ddoc, name) = reference
            .split_once('/')
            .ok_or_else(|| Error::BadRequest(format!("invalid filter reference: {reference}")))?;
        let design = self
            .get(&format!("_design/{ddoc}"), GetOptions::default())
            .await?;
        Ok(filter.with_selector(selector_from_design(&design, name)?))
    }

    /// Scan the by-sequence log joined with document metadata. A sequence
    /// is emitted only when it holds the winning revision of its document,
    /// which de-duplicates superseded bodies and tolerates a body that
    /// landed before its metadata.
    pub(crate) fn scan_changes(
        &self,
        opts: &ChangesOptions,
        filter: &ChangeFilter,
    ) -> Result<ChangesResponse> {
        let txn = self
            .inner
            .stores
            .by_seq
            .begin_read()
            .map_err(Error::storage)?;
        let table = txn.open_table(BY_SEQ).map_err(Error::storage)?;
        let range = if opts.descending {
            table.range::<u64>(..).map_err(Error::storage)?
        } else {
            table.range::<u64>(opts.since + 1..).map_err(Error::storage)?
        };
        let entries: Box<dyn Iterator<Item = _> + '_> = if opts.descending {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };

        let mut results = Vec::new();
        for entry in entries {
            let (key, value) = entry.map_err(Error::storage)?;
            let seq = key.value();
            let body: Map<String, Value> = serde_json::from_slice(value.value())?;
            let Some(id) = body.get("_id").and_then(Value::as_str).map(String::from) else {
                continue;
            };
            if is_local_id(&id) {
                continue;
            }
            let Some(meta) = self.fetch_meta(&id)? else {
                continue;
            };
            let Some(winning) = merge::winning_rev(&meta.rev_tree) else {
                continue;
            };
            if meta.rev_map.get(&winning.to_string()) != Some(&seq) {
                continue;
            }

            let doc = filter.needs_doc().then(|| {
                let mut doc = body.clone();
                doc.insert("_rev".into(), json!(winning.to_string()));
                if opts.conflicts {
                    let conflicts: Vec<String> = merge::collect_conflicts(&meta.rev_tree)
                        .iter()
                        .map(Revision::to_string)
                        .collect();
                    if !conflicts.is_empty() {
                        doc.insert("_conflicts".into(), json!(conflicts));
                    }
                }
                Value::Object(doc)
            });

            let mut event = ChangeEvent {
                seq,
                id,
                changes: collect_leaves(&meta.rev_tree)
                    .iter()
                    .map(|leaf| ChangeRev {
                        rev: leaf.rev().to_string(),
                    })
                    .collect(),
                deleted: merge::is_deleted(&meta.rev_tree),
                doc,
            };
            if !filter.apply(&mut event) {
                continue;
            }
            results.push(event);
            if opts.limit.is_some_and(|limit| results.len() as u64 >= limit) {
                break;
            }
        }

        let last_seq = results.last().map(|event| event.seq).unwrap_or(opts.since);
        Ok(ChangesResponse { results, last_seq })
    }
}
