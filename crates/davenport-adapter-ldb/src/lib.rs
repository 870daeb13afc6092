//! Persistent local storage adapter for Davenport.
//!
//! A database is a directory of four ordered key-value namespaces: the
//! document store (metadata with revision trees), the by-sequence log
//! (immutable JSON bodies keyed by a monotonically increasing sequence),
//! and the attachment digest/blob stores (content-addressed, reference
//! counted). On top of those this crate implements the CouchDB-style
//! write pipeline, the read path, a live change feed, and lifecycle
//! operations.
//!
//! ```no_run
//! use davenport_adapter_ldb::LdbAdapter;
//! use davenport_core::{BulkDocsOptions, GetOptions, OpenOptions};
//!
//! # async fn demo() -> davenport_core::Result<()> {
//! let db = LdbAdapter::open("/tmp/data", "mail", OpenOptions::default())?;
//! db.bulk_docs(
//!     vec![serde_json::json!({"_id": "inbox", "unread": 2})],
//!     BulkDocsOptions::new(),
//! )
//! .await?;
//! let doc = db.get("inbox", GetOptions::default()).await?;
//! assert_eq!(doc["unread"], 2);
//! # Ok(())
//! # }
//! ```

mod adapter;
mod changes;
mod store;
mod write;

pub use adapter::{ADAPTER_NAMES, LdbAdapter};
pub use changes::ChangesHandle;
