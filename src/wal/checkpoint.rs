//! Checkpoint and truncate (spec §4.3): bounds recovery work by recording a
//! snapshot of live transactions and reclaiming log space no longer needed
//! to undo or redo anything before it.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

use crate::error::Result;
use crate::page_store::PageStore;
use crate::wal::reader::{read_checkpoint_ptr, write_checkpoint_ptr, ForwardScan};
use crate::wal::record::LogRecord;
use crate::wal::writer::{lock_exclusive, LogWriter};
use crate::wal::{HEADER_SIZE, NO_CHECKPOINT};

impl LogWriter {
    /// `logCheckpoint()` (spec §4.3): forces the log, flushes every dirty
    /// page through `store`, records which transactions are still live,
    /// patches the checkpoint pointer, then truncates the log's dead
    /// prefix.
    pub fn log_checkpoint(&mut self, store: &mut dyn PageStore) -> Result<()> {
        self.append_preamble()?;
        self.force()?;
        store.flush_all_dirty()?;

        let entries: Vec<_> = self.live.iter().map(|(tid, off)| (*tid, *off)).collect();
        let min_live = entries.iter().map(|(_, off)| *off).min();
        let checkpoint_start = self.append_record(&LogRecord::Checkpoint { entries })?;
        self.force()?;

        write_checkpoint_ptr(&mut self.file, checkpoint_start as i64)?;
        self.file.seek(SeekFrom::Start(self.offset))?;
        self.force()?;

        log::info!(
            "wal: CHECKPOINT at offset={checkpoint_start} live={}",
            self.live.len()
        );

        // Nothing before the earliest live transaction's BEGIN (or, absent
        // any live transaction, the checkpoint record itself) can still be
        // needed for undo or redo.
        let keep_from = min_live.unwrap_or(checkpoint_start);
        self.log_truncate(keep_from)?;
        Ok(())
    }

    /// Rewrites the log so that its new prefix begins at `keep_from`,
    /// shifting every retained record's offsets (including the
    /// live-transaction table and the checkpoint pointer) down by
    /// `keep_from - HEADER_SIZE`. Atomic from an external reader's point of
    /// view: writes a sibling file, then renames over the original.
    pub(crate) fn log_truncate(&mut self, keep_from: u64) -> Result<()> {
        if keep_from <= HEADER_SIZE {
            return Ok(());
        }
        let shift = keep_from - HEADER_SIZE;

        let tmp_path = self.path.with_extension("logtmp");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        write_checkpoint_ptr(&mut tmp, NO_CHECKPOINT)?;

        let checkpoint_ptr = read_checkpoint_ptr(&mut self.file)?;

        let mut new_offset = HEADER_SIZE;
        let mut new_checkpoint_ptr = NO_CHECKPOINT;
        let mut new_live = std::collections::HashMap::new();

        {
            let mut scan = ForwardScan::from(&mut self.file, keep_from)?;
            while let Some((old_offset, record)) = scan.next_record()? {
                // Checkpoint entries embed absolute offsets into the old
                // file and must be shifted along with every trailing start
                // offset (spec §4.3/§9: "every embedded offset... is
                // shifted by minLogRecord − 8").
                // A superseded (non-current) checkpoint record can still be
                // inside the kept range if some transaction has stayed live
                // across multiple checkpoint cycles; its entries for
                // already-resolved transactions may predate the new prefix
                // and are never read back by recovery (which only consults
                // the checkpoint the pointer addresses), so a clamp here is
                // enough to keep them byte-sane rather than underflowing.
                let record = match record {
                    LogRecord::Checkpoint { entries } => LogRecord::Checkpoint {
                        entries: entries
                            .into_iter()
                            .map(|(tid, off)| (tid, off.saturating_sub(shift)))
                            .collect(),
                    },
                    other => other,
                };

                let bytes = record.encode(new_offset);
                tmp.seek(SeekFrom::Start(new_offset))?;
                tmp.write_all(&bytes)?;

                if checkpoint_ptr >= 0 && old_offset == checkpoint_ptr as u64 {
                    new_checkpoint_ptr = new_offset as i64;
                }
                if let LogRecord::Begin { tid } = &record {
                    if self.live.contains_key(tid) {
                        new_live.insert(*tid, new_offset);
                    }
                }

                new_offset += bytes.len() as u64;
            }
        }

        write_checkpoint_ptr(&mut tmp, new_checkpoint_ptr)?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)?;
        // Renaming over the locked file doesn't carry the flock to the new
        // open file description; reacquire it here.
        let new_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        lock_exclusive(&new_file)?;
        self.file = new_file;
        self.offset = new_offset;
        self.live = new_live;

        log::debug!(
            "wal: truncated log, new length={new_offset} shifted_by={shift} live={}",
            self.live.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_store::{PageId, SimplePageStore};

    #[test]
    fn checkpoint_with_no_live_transactions_truncates_to_just_the_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = LogWriter::open(dir.path().join("test.log")).unwrap();
        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();

        w.log_begin(1).unwrap();
        w.log_commit(1).unwrap();
        w.log_checkpoint(&mut store).unwrap();

        assert_eq!(w.live.len(), 0);
        let ptr = read_checkpoint_ptr(&mut w.file).unwrap();
        assert_eq!(ptr, HEADER_SIZE as i64);
    }

    #[test]
    fn checkpoint_with_live_transaction_keeps_its_begin_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = LogWriter::open(dir.path().join("test.log")).unwrap();
        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
        let page_id = PageId(vec![1]);
        store.write_page(&page_id, b"AAAA").unwrap();

        w.log_begin(1).unwrap();
        w.log_update(1, &store, &page_id, b"AAAA", b"BBBB")
            .unwrap();
        store.write_page(&page_id, b"BBBB").unwrap();

        w.log_checkpoint(&mut store).unwrap();

        assert!(w.is_live(1));
        // The BEGIN for tid 1 must still be readable after truncation.
        let mut scan = ForwardScan::from(&mut w.file, HEADER_SIZE).unwrap();
        let (_, first) = scan.next_record().unwrap().unwrap();
        assert_eq!(first.tid(), Some(1));
    }

    #[test]
    fn truncate_preserves_appendability() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = LogWriter::open(dir.path().join("test.log")).unwrap();
        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();

        w.log_begin(1).unwrap();
        w.log_commit(1).unwrap();
        w.log_checkpoint(&mut store).unwrap();

        w.log_begin(2).unwrap();
        w.log_commit(2).unwrap();
        assert!(!w.is_live(2));
    }
}
