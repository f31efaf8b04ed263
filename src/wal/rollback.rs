//! Rollback (spec §4.2): restores before-images for a single transaction,
//! or for a set of loser transactions during recovery's undo phase.

use std::collections::HashSet;
use std::io::Seek;

use crate::error::{Result, WalError};
use crate::page_store::PageStore;
use crate::wal::reader::{BackwardScan, ForwardScan};
use crate::wal::record::{LogRecord, PageImage, Tid};
use crate::wal::writer::LogWriter;

/// Installs one collected before-image through `store`, discarding the
/// after-image's cached copy first (spec §4.2 step 4).
fn install_before_image(store: &mut dyn PageStore, before: &PageImage) -> Result<()> {
    let id = store.reconstruct_page_id(&before.id_tag, before.id.ints())?;
    store.discard_cached(&id);
    let page = store.reconstruct_page(&before.page_tag, &id, &before.data)?;
    store.write_page(&id, page.bytes())
}

impl LogWriter {
    /// Single-transaction rollback from the in-memory live-transaction
    /// table (spec §4.2 algorithm). Called from `logAbort`.
    pub(crate) fn rollback(&mut self, tid: Tid, store: &mut dyn PageStore) -> Result<()> {
        let start = *self
            .live
            .get(&tid)
            .ok_or(WalError::UnknownTid(tid))?;
        let end = self.offset;

        let mut before_images = Vec::new();
        {
            let mut scan = ForwardScan::from(&mut self.file, start)?;
            while let Some((offset, record)) = scan.next_record()? {
                if offset >= end {
                    break;
                }
                if let LogRecord::Update {
                    tid: rec_tid,
                    before,
                    ..
                } = record
                {
                    if rec_tid == tid {
                        before_images.push(before);
                    }
                }
            }
        }

        // LIFO: the earliest before-image for a repeatedly-updated page
        // must win, so apply in reverse collection order (spec §4.2
        // ordering note).
        for before in before_images.into_iter().rev() {
            install_before_image(store, &before)?;
        }

        self.file.seek(std::io::SeekFrom::Start(self.offset))?;
        Ok(())
    }
}

/// Bulk rollback variant used by recovery's undo phase (spec §4.2): scans
/// backward from `end` across the whole log (not just one transaction's
/// range), collecting before-images for every TID in `losers`.
pub(crate) fn bulk_rollback(
    file: &mut std::fs::File,
    losers: &HashSet<Tid>,
    end: u64,
    store: &mut dyn PageStore,
) -> Result<()> {
    let mut before_images = Vec::new();
    let mut scan = BackwardScan::from(file, end);
    while let Some((_, record)) = scan.prev_record()? {
        if let LogRecord::Update {
            tid: rec_tid,
            before,
            ..
        } = record
        {
            if losers.contains(&rec_tid) {
                before_images.push(before);
            }
        }
    }

    // `before_images` was collected walking backward through the log, so
    // it is already in LIFO application order (most recent update first).
    for before in before_images {
        install_before_image(store, &before)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_store::{PageId, SimplePageStore};

    #[test]
    fn rollback_restores_earliest_before_image_on_double_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = LogWriter::open(dir.path().join("test.log")).unwrap();
        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
        let page_id = PageId(vec![1]);
        store.write_page(&page_id, b"AA").unwrap();

        w.log_begin(1).unwrap();
        w.log_update(1, &store, &page_id, b"AA", b"BB").unwrap();
        store.write_page(&page_id, b"BB").unwrap();
        w.log_update(1, &store, &page_id, b"BB", b"CC").unwrap();
        store.write_page(&page_id, b"CC").unwrap();

        w.log_abort(1, &mut store).unwrap();

        assert_eq!(store.load_page(&page_id).unwrap().bytes(), b"AA");
    }

    #[test]
    fn rollback_unknown_tid_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = LogWriter::open(dir.path().join("test.log")).unwrap();
        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
        let err = w.log_abort(42, &mut store).unwrap_err();
        assert!(matches!(err, WalError::UnknownTid(42)));
    }

    #[test]
    fn rollback_ignores_other_transactions_updates() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = LogWriter::open(dir.path().join("test.log")).unwrap();
        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
        let p = PageId(vec![1]);
        let q = PageId(vec![2]);
        store.write_page(&p, b"AA").unwrap();
        store.write_page(&q, b"xx").unwrap();

        w.log_begin(1).unwrap();
        w.log_update(1, &store, &p, b"AA", b"BB").unwrap();
        store.write_page(&p, b"BB").unwrap();

        w.log_begin(2).unwrap();
        w.log_update(2, &store, &q, b"xx", b"yy").unwrap();
        store.write_page(&q, b"yy").unwrap();
        w.log_commit(2).unwrap();

        w.log_abort(1, &mut store).unwrap();

        assert_eq!(store.load_page(&p).unwrap().bytes(), b"AA");
        assert_eq!(store.load_page(&q).unwrap().bytes(), b"yy");
    }
}
