//! Core types and algorithms for Davenport, a document database with
//! CouchDB-style multi-version revision histories.
//!
//! Storage adapters consume this crate for:
//! - the revision tree model and merge algebra ([`rev_tree`], [`merge`]),
//! - incoming document parsing ([`parse`]),
//! - change filtering ([`filter`]),
//! - shared option/response types and the error taxonomy.

pub mod adapter;
pub mod document;
pub mod error;
pub mod filter;
pub mod merge;
pub mod parse;
pub mod rev_tree;

pub use adapter::Adapter;
pub use document::{
    AllDocsOptions, AllDocsResponse, AllDocsRow, AllDocsRowValue, BulkDocsOptions, ChangeEvent,
    ChangeRev, ChangesOptions, ChangesResponse, DbInfo, DocMeta, DocResult, GetAttachmentOptions,
    GetOptions, OpenOptions, Revision,
};
pub use error::{Error, Result};
pub use filter::ChangeFilter;
pub use parse::{ParsedDoc, is_local_id, parse_doc};
pub use rev_tree::{Leaf, RevNode, RevPath, RevStatus, RevTree};
