//! Write-ahead log and crash-recovery subsystem for an educational
//! relational database.
//!
//! This crate owns the log-record binary format, the WAL append protocol,
//! per-transaction rollback, checkpointing/truncation, and crash recovery.
//! It treats table pages as opaque byte blobs: callers hand it a
//! [`page_store::PageStore`] implementation and the WAL never interprets
//! page contents itself.
//!
//! The buffer pool, catalog, lock scheduling, SQL front end, and query
//! planner that would surround this subsystem in a full database are out of
//! scope; [`page_store::PageStore`] is the single seam through which this
//! crate talks to them.

pub mod error;
pub mod page_store;
pub mod wal;

pub use error::{Result, WalError};
pub use page_store::{Page, PageId, PageStore, SimplePageStore};
pub use wal::recovery::{analyze, recover, AnalysisReport};
pub use wal::writer::{LogManager, LogWriter};
