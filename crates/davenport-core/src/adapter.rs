use async_trait::async_trait;
use serde_json::Value;

use crate::document::{
    AllDocsOptions, AllDocsResponse, BulkDocsOptions, ChangesOptions, ChangesResponse, DbInfo,
    DocResult, GetAttachmentOptions, GetOptions, Revision,
};
use crate::error::Result;
use crate::rev_tree::RevTree;

/// Storage adapter contract.
///
/// Implementations own a single logical database: documents with revision
/// trees, bodies in an append-only sequence log, content-addressed
/// attachments, and a change feed.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Engine name, e.g. `"leveldb"`.
    fn kind(&self) -> &'static str;

    /// Database name.
    fn id(&self) -> &str;

    async fn info(&self) -> Result<DbInfo>;

    /// Fetch a document as JSON with `_id`/`_rev` stamped.
    async fn get(&self, doc_id: &str, opts: GetOptions) -> Result<Value>;

    /// Fetch raw attachment bytes (base64 text bytes when `opts.encode`).
    async fn get_attachment(
        &self,
        doc_id: &str,
        name: &str,
        opts: GetAttachmentOptions,
    ) -> Result<Vec<u8>>;

    async fn all_docs(&self, opts: AllDocsOptions) -> Result<AllDocsResponse>;

    /// Write a batch of documents; per-document outcomes in input order.
    async fn bulk_docs(&self, docs: Vec<Value>, opts: BulkDocsOptions) -> Result<Vec<DocResult>>;

    /// One-shot change feed.
    async fn changes(&self, opts: ChangesOptions) -> Result<ChangesResponse>;

    async fn get_revision_tree(&self, doc_id: &str) -> Result<RevTree>;

    /// Compaction primitive: drop the stored bodies of specific revisions.
    /// Metadata and attachment references are left to the caller.
    async fn remove_doc_revisions(&self, doc_id: &str, revs: &[Revision]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
