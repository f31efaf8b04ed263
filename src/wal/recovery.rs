//! Crash recovery (spec §4.4): analysis, redo-all, undo-losers, redo-winners.
//!
//! Run once at startup in place of [`LogWriter::open`]'s lazy truncation:
//! callers that want crash safety call [`recover`] instead of letting the
//! first append reset the file.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::Path;

use crate::error::Result;
use crate::page_store::PageStore;
use crate::wal::reader::{read_checkpoint_ptr, ForwardScan};
use crate::wal::record::{LogRecord, PageImage, Tid};
use crate::wal::rollback::bulk_rollback;
use crate::wal::writer::LogWriter;
use crate::wal::HEADER_SIZE;

/// A read-only summary of a log file's contents, produced by [`analyze`]
/// without touching a [`PageStore`] or the log file itself. Used by the
/// `wal-inspect` binary, which reports on a log without running real
/// recovery against it.
#[derive(Debug, Default)]
pub struct AnalysisReport {
    pub checkpoint_offset: Option<u64>,
    pub committed: Vec<Tid>,
    pub aborted: Vec<Tid>,
    pub live_at_eof: Vec<Tid>,
    pub update_count: u64,
}

/// Scans `path` read-only and reports which transactions committed,
/// aborted, or were still live at end of file, without mutating the log or
/// replaying anything through a page store. Returns `CorruptLog` on any
/// malformed or truncated record (spec §4.1/§7).
pub fn analyze(path: impl AsRef<Path>) -> Result<AnalysisReport> {
    let mut file = OpenOptions::new().read(true).open(path)?;
    let len = file.metadata()?.len();
    let mut report = AnalysisReport::default();
    if len <= HEADER_SIZE {
        return Ok(report);
    }

    let checkpoint_ptr = read_checkpoint_ptr(&mut file)?;
    let analysis_start = if checkpoint_ptr >= 0 {
        report.checkpoint_offset = Some(checkpoint_ptr as u64);
        checkpoint_ptr as u64
    } else {
        HEADER_SIZE
    };

    let mut live: HashMap<Tid, u64> = HashMap::new();
    let mut scan = ForwardScan::from(&mut file, analysis_start)?;
    while let Some((offset, record)) = scan.next_record()? {
        match record {
            LogRecord::Begin { tid } => {
                live.insert(tid, offset);
            }
            LogRecord::Commit { tid } => {
                live.remove(&tid);
                report.committed.push(tid);
            }
            LogRecord::Abort { tid } => {
                live.remove(&tid);
                report.aborted.push(tid);
            }
            LogRecord::Checkpoint { entries } => {
                for (tid, begin_offset) in entries {
                    live.entry(tid).or_insert(begin_offset);
                }
            }
            LogRecord::Update { .. } => {
                report.update_count += 1;
            }
        }
    }
    report.live_at_eof = live.into_keys().collect();
    report.live_at_eof.sort_unstable();
    Ok(report)
}

/// Opens the log at `path` and brings it to a consistent state, replaying
/// and undoing whatever the crash left behind. Returns a [`LogWriter`] with
/// an empty live-transaction table (spec §4.4 post-condition): every
/// transaction that was live at crash time has either been fully redone and
/// confirmed durable, or fully undone here. Recovery never appends to the
/// log itself, only to the page store, so running it twice in a row is
/// idempotent.
///
/// Acquires `store`'s pool mutex before touching anything (spec §5: Recovery
/// is one of the four operations that must take the pool mutex before the
/// log), and holds it for the whole pass.
pub fn recover(path: impl AsRef<Path>, store: &mut dyn PageStore) -> Result<LogWriter> {
    let pool = store.pool_mutex();
    let _pool_guard = pool.lock();

    let mut writer = LogWriter::open(path)?;
    let len = writer.file.metadata()?.len();

    // An empty or header-only file has nothing to recover; treat it the
    // same as a fresh log (spec §4.4 edge case).
    if len <= HEADER_SIZE {
        writer.adopt_recovered_state(HashMap::new());
        return Ok(writer);
    }

    // Phase 0: analysis. Seed `losers` from the checkpoint record, if any.
    let checkpoint_ptr = read_checkpoint_ptr(&mut writer.file)?;
    let mut losers: HashMap<Tid, u64> = HashMap::new();
    if checkpoint_ptr >= 0 {
        let mut scan = ForwardScan::from(&mut writer.file, checkpoint_ptr as u64)?;
        match scan.next_record()? {
            Some((_, LogRecord::Checkpoint { entries })) => {
                for (tid, first_offset) in entries {
                    losers.insert(tid, first_offset);
                }
            }
            _ => {
                return Err(crate::error::WalError::CorruptLog(format!(
                    "checkpoint pointer {checkpoint_ptr} does not reference a checkpoint record"
                )))
            }
        }
    }
    let mut winners: HashSet<Tid> = HashSet::new();

    // Phase 1: redo all. Faithful to the source: always rescans from offset
    // 8 rather than the record after the checkpoint (documented open
    // question — correct but wasteful, since every BEGIN still relevant to
    // `losers` survived the last truncation and is re-seen here regardless).
    // The same pass updates `losers`/`winners` as BEGIN/COMMIT/ABORT records
    // are encountered.
    {
        let mut scan = ForwardScan::from(&mut writer.file, HEADER_SIZE)?;
        while let Some((offset, record)) = scan.next_record()? {
            match record {
                LogRecord::Update { after, .. } => {
                    redo_after_image(store, &after)?;
                }
                LogRecord::Begin { tid } => {
                    losers.insert(tid, offset);
                }
                LogRecord::Commit { tid } => {
                    losers.remove(&tid);
                    winners.insert(tid);
                }
                // Resolution of the ABORT-durability open question (spec §9
                // option (b)): an aborted transaction stays in `losers`
                // rather than being cleared, so Phase 2 re-applies its
                // before-images unconditionally. `logAbort` writes those
                // same before-images through the page store without forcing
                // it, so a crash between that write and the next checkpoint
                // could otherwise leave a non-durable rollback in place.
                LogRecord::Abort { .. } => {}
                LogRecord::Checkpoint { .. } => {}
            }
        }
    }

    log::info!(
        "wal: recovery phase 1 done, {} loser(s), {} winner(s)",
        losers.len(),
        winners.len()
    );

    // Phase 2: undo losers. Backward scan across the whole log, applying
    // before-images for every transaction that never committed, plus every
    // transaction that aborted (re-applying its before-images idempotently
    // in case its own rollback write wasn't durable).
    if !losers.is_empty() {
        let loser_tids: HashSet<Tid> = losers.keys().copied().collect();
        bulk_rollback(&mut writer.file, &loser_tids, len, store)?;
    }

    // Phase 3: redo winners. Phase 2's undo may have overwritten a page a
    // winner legally modified after a loser had touched the same page; redo
    // every winner's after-image once more to supersede that undo.
    if !winners.is_empty() {
        let mut scan = ForwardScan::from(&mut writer.file, HEADER_SIZE)?;
        while let Some((_, record)) = scan.next_record()? {
            if let LogRecord::Update { tid, after, .. } = record {
                if winners.contains(&tid) {
                    redo_after_image(store, &after)?;
                }
            }
        }
    }

    writer.adopt_recovered_state(HashMap::new());
    log::info!("wal: recovery complete, log ends at offset {len}");
    Ok(writer)
}

fn redo_after_image(store: &mut dyn PageStore, after: &PageImage) -> Result<()> {
    let id = store.reconstruct_page_id(&after.id_tag, after.id.ints())?;
    store.discard_cached(&id);
    let page = store.reconstruct_page(&after.page_tag, &id, &after.data)?;
    store.write_page(&id, page.bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_store::{PageId, SimplePageStore};

    fn log_path(dir: &std::path::Path) -> std::path::PathBuf {
        dir.join("test.log")
    }

    #[test]
    fn recovery_on_fresh_log_yields_no_live_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
        let writer = recover(log_path(dir.path()), &mut store).unwrap();
        assert_eq!(writer.live_transactions().count(), 0);
    }

    #[test]
    fn committed_update_survives_crash_without_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path());
        let page_id = PageId(vec![1]);
        {
            let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
            store.write_page(&page_id, b"AAAA").unwrap();
            let mut w = LogWriter::open(&path).unwrap();
            w.log_begin(1).unwrap();
            w.log_update(1, &store, &page_id, b"AAAA", b"BBBB")
                .unwrap();
            // Crash: the page store never actually receives the after-image.
            w.log_commit(1).unwrap();
        }

        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
        let writer = recover(&path, &mut store).unwrap();
        assert_eq!(writer.live_transactions().count(), 0);
        assert_eq!(store.load_page(&page_id).unwrap().bytes(), b"BBBB");
    }

    #[test]
    fn uncommitted_update_is_undone_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path());
        let page_id = PageId(vec![1]);
        {
            let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
            store.write_page(&page_id, b"AAAA").unwrap();
            let mut w = LogWriter::open(&path).unwrap();
            w.log_begin(1).unwrap();
            w.log_update(1, &store, &page_id, b"AAAA", b"BBBB")
                .unwrap();
            store.write_page(&page_id, b"BBBB").unwrap();
            // Crash: no COMMIT or ABORT was ever logged.
        }

        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
        let writer = recover(&path, &mut store).unwrap();
        assert_eq!(writer.live_transactions().count(), 0);
        assert_eq!(store.load_page(&page_id).unwrap().bytes(), b"AAAA");
    }

    #[test]
    fn recovery_ignores_pages_left_untouched_since_last_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path());
        let page_id = PageId(vec![1]);
        let page_id2 = PageId(vec![2]);
        {
            let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
            store.write_page(&page_id, b"AAAA").unwrap();
            store.write_page(&page_id2, b"xxxx").unwrap();
            let mut w = LogWriter::open(&path).unwrap();
            w.log_begin(1).unwrap();
            w.log_commit(1).unwrap();
            w.log_checkpoint(&mut store).unwrap();

            w.log_begin(2).unwrap();
            w.log_update(2, &store, &page_id2, b"xxxx", b"yyyy")
                .unwrap();
            store.write_page(&page_id2, b"yyyy").unwrap();
            // Crash: tid 2 never committed or aborted.
        }

        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
        let writer = recover(&path, &mut store).unwrap();
        assert_eq!(writer.live_transactions().count(), 0);
        assert_eq!(store.load_page(&page_id2).unwrap().bytes(), b"xxxx");
    }

    #[test]
    fn recovery_reapplies_an_aborts_before_image_even_if_its_own_write_was_lost() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path());
        let page_id = PageId(vec![1]);
        {
            let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
            store.write_page(&page_id, b"AAAA").unwrap();
            let mut w = LogWriter::open(&path).unwrap();
            w.log_begin(1).unwrap();
            w.log_update(1, &store, &page_id, b"AAAA", b"BBBB")
                .unwrap();
            store.write_page(&page_id, b"BBBB").unwrap();
            w.log_abort(1, &mut store).unwrap();
            // logAbort's own rollback already restored AAAA through the
            // page store, but simulate that write never reaching disk
            // before the crash by leaving the after-image there instead.
            store.write_page(&page_id, b"BBBB").unwrap();
        }

        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
        recover(&path, &mut store).unwrap();
        assert_eq!(store.load_page(&page_id).unwrap().bytes(), b"AAAA");
    }

    #[test]
    fn winner_redo_supersedes_loser_undo_on_the_same_page() {
        // Scenario 6: T1 touches P but never commits; T2 touches the same
        // page afterward and does commit. Phase 2's undo of T1 must not be
        // the final word on P — phase 3 has to redo T2's after-image too.
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path());
        let page_id = PageId(vec![1]);
        {
            let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
            store.write_page(&page_id, b"AA").unwrap();
            let mut w = LogWriter::open(&path).unwrap();
            w.log_begin(1).unwrap();
            w.log_update(1, &store, &page_id, b"AA", b"BB").unwrap();
            store.write_page(&page_id, b"BB").unwrap();

            w.log_begin(2).unwrap();
            w.log_update(2, &store, &page_id, b"BB", b"CC").unwrap();
            store.write_page(&page_id, b"CC").unwrap();
            w.log_commit(2).unwrap();
            // Crash: T1 never committed or aborted.
        }

        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
        let writer = recover(&path, &mut store).unwrap();
        assert_eq!(writer.live_transactions().count(), 0);
        assert_eq!(store.load_page(&page_id).unwrap().bytes(), b"CC");
    }

    #[test]
    fn corrupt_log_is_reported_not_silently_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = log_path(dir.path());
        {
            let mut w = LogWriter::open(&path).unwrap();
            w.log_begin(1).unwrap();
        }
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 2);
        std::fs::write(&path, bytes).unwrap();

        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
        let err = recover(&path, &mut store).unwrap_err();
        assert!(matches!(err, crate::error::WalError::CorruptLog(_)));
    }
}
