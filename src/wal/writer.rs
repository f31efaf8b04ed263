//! LogWriter: owns the append-only log file, serializes records, and
//! enforces force-on-commit (spec §4.1).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use parking_lot::Mutex;

use crate::error::{Result, WalError};
use crate::page_store::{PageId, PageStore};
use crate::wal::reader::{read_checkpoint_ptr, write_checkpoint_ptr};
use crate::wal::record::{LogRecord, PageImage, Tid};
use crate::wal::{HEADER_SIZE, NO_CHECKPOINT};

/// Owns the log file handle, the append offset, and the live-transaction
/// table (spec §3/§4.1). Not `Sync`-safe by itself — callers that need the
/// spec §5 locking discipline should go through [`LogManager`].
#[derive(Debug)]
pub struct LogWriter {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    /// Current end-of-file / next append position.
    pub(crate) offset: u64,
    /// TID -> offset of that transaction's BEGIN record.
    pub(crate) live: HashMap<Tid, u64>,
    /// True until the first append or a successful `recover()`, per spec
    /// §4.1's append-preamble.
    pub(crate) recovery_undecided: bool,
}

/// Takes the process-level exclusive lock a `LogWriter` holds on its file for
/// its whole lifetime: only one process may have a given log open for
/// writing at a time. Non-blocking, since a second opener is a
/// misconfiguration to report immediately rather than a contended resource
/// worth waiting on.
pub(crate) fn lock_exclusive(file: &File) -> Result<()> {
    file.try_lock_exclusive()
        .map_err(|e| WalError::Lock(format!("log file is already locked by another process: {e}")))
}

impl LogWriter {
    /// Opens (creating if necessary) the log file at `path`. Does not
    /// truncate it — that only happens lazily, in `append_preamble`, if the
    /// caller never calls `recover()` first.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        lock_exclusive(&file)?;
        let len = file.metadata()?.len();
        Ok(LogWriter {
            file,
            path,
            offset: len,
            live: HashMap::new(),
            recovery_undecided: true,
        })
    }

    pub fn live_transactions(&self) -> impl Iterator<Item = (Tid, u64)> + '_ {
        self.live.iter().map(|(tid, off)| (*tid, *off))
    }

    pub fn is_live(&self, tid: Tid) -> bool {
        self.live.contains_key(&tid)
    }

    /// First append since open: the caller chose not to recover, so the
    /// file is reset to a fresh, empty log (spec §4.1). A no-op after the
    /// first call, or after `recovery::recover` has run.
    pub(crate) fn append_preamble(&mut self) -> Result<()> {
        if self.recovery_undecided {
            self.file.set_len(0)?;
            write_checkpoint_ptr(&mut self.file, NO_CHECKPOINT)?;
            self.offset = HEADER_SIZE;
            self.recovery_undecided = false;
        }
        Ok(())
    }

    /// Used by `recovery::recover` to hand a freshly-scanned log back to a
    /// writer ready to accept new appends, with the live-transaction table
    /// populated per spec §3 invariant 4.
    pub(crate) fn adopt_recovered_state(&mut self, live: HashMap<Tid, u64>) {
        self.recovery_undecided = false;
        self.live = live;
    }

    pub(crate) fn append_record(&mut self, record: &LogRecord) -> Result<u64> {
        let start = self.offset;
        self.file.seek(SeekFrom::Start(start))?;
        let bytes = record.encode(start);
        self.file.write_all(&bytes)?;
        self.offset += bytes.len() as u64;
        Ok(start)
    }

    /// `logBegin(tid)`. Fails with `DuplicateBegin` if `tid` is already live.
    pub fn log_begin(&mut self, tid: Tid) -> Result<()> {
        self.append_preamble()?;
        if self.live.contains_key(&tid) {
            return Err(crate::error::WalError::DuplicateBegin(tid));
        }
        let start = self.append_record(&LogRecord::Begin { tid })?;
        self.live.insert(tid, start);
        log::trace!("wal: BEGIN tid={tid} offset={start}");
        Ok(())
    }

    /// `logUpdate(tid, before, after)`. Does not force; the buffer pool must
    /// call this before writing the new page image back through the
    /// `PageStore` (write-ahead rule, spec §4.1/§5).
    pub fn log_update(
        &mut self,
        tid: Tid,
        store: &dyn PageStore,
        page_id: &PageId,
        before: &[u8],
        after: &[u8],
    ) -> Result<()> {
        self.append_preamble()?;
        let tag = store.type_tag(page_id).to_string();
        let before = PageImage {
            page_tag: tag.clone(),
            id_tag: tag.clone(),
            id: page_id.clone(),
            data: before.to_vec(),
        };
        let after = PageImage {
            page_tag: tag.clone(),
            id_tag: tag,
            id: page_id.clone(),
            data: after.to_vec(),
        };
        let start = self.append_record(&LogRecord::Update { tid, before, after })?;
        log::trace!("wal: UPDATE tid={tid} page={page_id:?} offset={start}");
        Ok(())
    }

    /// `logCommit(tid)`. Forces before returning, so a successful return
    /// guarantees durability (spec §4.1 post-condition).
    pub fn log_commit(&mut self, tid: Tid) -> Result<()> {
        self.append_preamble()?;
        let start = self.append_record(&LogRecord::Commit { tid })?;
        self.force()?;
        self.live.remove(&tid);
        log::debug!("wal: COMMIT tid={tid} durable at offset={start}");
        Ok(())
    }

    /// `logAbort(tid)`: rolls the transaction back, writes the ABORT
    /// record, forces, and drops it from the live table (spec §4.1). The
    /// rollback step is implemented in `rollback.rs`.
    pub fn log_abort(&mut self, tid: Tid, store: &mut dyn PageStore) -> Result<()> {
        self.append_preamble()?;
        self.rollback(tid, store)?;
        let start = self.append_record(&LogRecord::Abort { tid })?;
        self.force()?;
        self.live.remove(&tid);
        log::warn!("wal: ABORT tid={tid} rolled back, durable at offset={start}");
        Ok(())
    }

    /// Flushes buffered writes, including file metadata, to durable
    /// storage. Blocking.
    pub fn force(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Debug dump: writes one line per record, in file order, without
    /// disturbing the append cursor (spec §6 `print`).
    pub fn print(&mut self, out: &mut dyn Write) -> Result<()> {
        crate::wal::reader::dump(&mut self.file, out)?;
        self.file.seek(SeekFrom::Start(self.offset))?;
        Ok(())
    }

    /// Writes a final checkpoint and leaves the file positioned for the
    /// next open to find a consistent state.
    pub fn shutdown(&mut self, store: &mut dyn PageStore) -> Result<()> {
        self.log_checkpoint(store)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_offset(&self) -> u64 {
        self.offset
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Thin concurrency wrapper matching spec §5: a single log mutex around
/// `LogWriter`, with callers that also touch buffered pages (abort,
/// checkpoint) acquiring the `PageStore`'s pool mutex first.
pub struct LogManager {
    writer: Mutex<LogWriter>,
}

impl LogManager {
    pub fn new(writer: LogWriter) -> Self {
        LogManager {
            writer: Mutex::new(writer),
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(LogWriter::open(path)?))
    }

    /// Runs recovery against the log at `path` and wraps the result. Per
    /// spec §5, Recovery is one of the four operations ordered pool mutex
    /// before log mutex; `wal::recovery::recover` acquires the pool mutex
    /// itself for the duration of the pass.
    pub fn recover(path: impl AsRef<Path>, store: &mut dyn PageStore) -> Result<Self> {
        Ok(Self::new(crate::wal::recovery::recover(path, store)?))
    }

    pub fn begin(&self, tid: Tid) -> Result<()> {
        self.writer.lock().log_begin(tid)
    }

    pub fn update(
        &self,
        tid: Tid,
        store: &dyn PageStore,
        page_id: &PageId,
        before: &[u8],
        after: &[u8],
    ) -> Result<()> {
        self.writer.lock().log_update(tid, store, page_id, before, after)
    }

    pub fn commit(&self, tid: Tid) -> Result<()> {
        self.writer.lock().log_commit(tid)
    }

    /// Acquires the pool mutex before the log mutex, per spec §5.
    pub fn abort(&self, tid: Tid, store: &mut dyn PageStore) -> Result<()> {
        let pool = store.pool_mutex();
        let _pool_guard = pool.lock();
        self.writer.lock().log_abort(tid, store)
    }

    /// Acquires the pool mutex before the log mutex, per spec §5.
    pub fn checkpoint(&self, store: &mut dyn PageStore) -> Result<()> {
        let pool = store.pool_mutex();
        let _pool_guard = pool.lock();
        self.writer.lock().log_checkpoint(store)
    }

    pub fn force(&self) -> Result<()> {
        self.writer.lock().force()
    }

    pub fn print(&self, out: &mut dyn Write) -> Result<()> {
        self.writer.lock().print(out)
    }

    pub fn shutdown(&self, store: &mut dyn PageStore) -> Result<()> {
        let pool = store.pool_mutex();
        let _pool_guard = pool.lock();
        self.writer.lock().shutdown(store)
    }

    pub fn live_transaction_count(&self) -> usize {
        self.writer.lock().live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_store::SimplePageStore;

    fn open_writer(dir: &std::path::Path) -> LogWriter {
        LogWriter::open(dir.join("test.log")).unwrap()
    }

    #[test]
    fn begin_then_duplicate_begin_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_writer(dir.path());
        w.log_begin(1).unwrap();
        let err = w.log_begin(1).unwrap_err();
        assert!(matches!(err, crate::error::WalError::DuplicateBegin(1)));
    }

    #[test]
    fn commit_removes_from_live_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_writer(dir.path());
        w.log_begin(1).unwrap();
        assert!(w.is_live(1));
        w.log_commit(1).unwrap();
        assert!(!w.is_live(1));
    }

    #[test]
    fn first_append_truncates_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        std::fs::write(&path, b"garbage-not-a-log-file").unwrap();
        let mut w = LogWriter::open(&path).unwrap();
        w.log_begin(1).unwrap();
        let ptr = read_checkpoint_ptr(&mut w.file).unwrap();
        assert_eq!(ptr, NO_CHECKPOINT);
    }

    #[test]
    fn abort_restores_before_image_via_page_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_writer(dir.path());
        let mut store = SimplePageStore::open(dir.path().join("pages")).unwrap();
        let page_id = PageId(vec![1]);
        store.write_page(&page_id, b"AAAA").unwrap();

        w.log_begin(1).unwrap();
        w.log_update(1, &store, &page_id, b"AAAA", b"BBBB").unwrap();
        store.write_page(&page_id, b"BBBB").unwrap();
        w.log_abort(1, &mut store).unwrap();

        assert_eq!(store.load_page(&page_id).unwrap().bytes(), b"AAAA");
        assert!(!w.is_live(1));
    }

    #[test]
    fn print_does_not_disturb_append_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = open_writer(dir.path());
        w.log_begin(1).unwrap();
        let offset_before = w.current_offset();
        let mut out = Vec::new();
        w.print(&mut out).unwrap();
        assert_eq!(w.current_offset(), offset_before);
        w.log_commit(1).unwrap();
        assert!(w.current_offset() > offset_before);
    }
}
