//! Shared log-scanning primitives used by `writer` (print), `rollback`, and
//! `recovery`. Kept separate from `record.rs` because this module owns file
//! positioning and offset bookkeeping, while `record.rs` only knows how to
//! turn bytes into a [`LogRecord`] and back.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Result, WalError};
use crate::wal::record::LogRecord;
use crate::wal::HEADER_SIZE;

/// Reads the checkpoint pointer at offset 0: `-1` if none, else the offset
/// of the most recent CHECKPOINT record.
pub fn read_checkpoint_ptr(file: &mut File) -> Result<i64> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf).map_err(|e| {
        WalError::CorruptLog(format!("failed to read checkpoint pointer header: {e}"))
    })?;
    Ok(i64::from_be_bytes(buf))
}

/// Overwrites the checkpoint pointer at offset 0. Does not move the
/// caller's append cursor; the caller must reseek before its next write.
pub fn write_checkpoint_ptr(file: &mut File, ptr: i64) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&ptr.to_be_bytes())?;
    Ok(())
}

/// Scans a log file forward, yielding `(offset, record)` pairs in file
/// order. Validates spec §3 invariant 2 (a record's trailing start offset
/// must equal its own beginning) as it goes.
pub struct ForwardScan<'f> {
    file: &'f mut File,
}

impl<'f> ForwardScan<'f> {
    pub fn from(file: &'f mut File, start_offset: u64) -> Result<Self> {
        file.seek(SeekFrom::Start(start_offset))?;
        Ok(ForwardScan { file })
    }

    pub fn next_record(&mut self) -> Result<Option<(u64, LogRecord)>> {
        let offset = self.file.stream_position()?;
        match LogRecord::decode(&mut self.file)? {
            None => Ok(None),
            Some((record, start)) => {
                if start != offset {
                    return Err(WalError::CorruptLog(format!(
                        "record at offset {offset} has trailing start {start}"
                    )));
                }
                Ok(Some((offset, record)))
            }
        }
    }
}

impl<'f> Iterator for ForwardScan<'f> {
    type Item = Result<(u64, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Writes one line per record, in file order, starting from the checkpoint
/// pointer header at offset 0 (spec §6 `print`). Leaves the file positioned
/// wherever the scan ends; callers that keep writing afterward must reseek.
/// Takes only a `&mut File`, not a `LogWriter`, so a read-only inspection
/// tool can dump a log without holding the writer's exclusive lock.
pub fn dump(file: &mut File, out: &mut dyn Write) -> Result<()> {
    let ptr = read_checkpoint_ptr(file)?;
    writeln!(out, "checkpoint pointer: {ptr}")?;
    let mut scan = ForwardScan::from(file, HEADER_SIZE)?;
    while let Some((offset, record)) = scan.next_record()? {
        match &record {
            LogRecord::Update { tid, before, after } => writeln!(
                out,
                "{offset}: UPDATE tid={tid} before_len={} after_len={}",
                before.data.len(),
                after.data.len()
            )?,
            LogRecord::Checkpoint { entries } => {
                writeln!(out, "{offset}: CHECKPOINT live={}", entries.len())?
            }
            _ => writeln!(
                out,
                "{offset}: {} tid={:?}",
                record.kind_name(),
                record.tid()
            )?,
        }
    }
    Ok(())
}

/// Scans a log file backward from `end_offset`, following each record's
/// trailing start offset to find its predecessor (spec §4.2 bulk rollback).
/// Each record is still decoded forward (from its start) since only then
/// are its variable-length fields self-delimiting.
pub struct BackwardScan<'f> {
    file: &'f mut File,
    pos: u64,
}

impl<'f> BackwardScan<'f> {
    pub fn from(file: &'f mut File, end_offset: u64) -> Self {
        BackwardScan {
            file,
            pos: end_offset,
        }
    }

    pub fn prev_record(&mut self) -> Result<Option<(u64, LogRecord)>> {
        if self.pos <= HEADER_SIZE {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(self.pos - 8))?;
        let mut trailer = [0u8; 8];
        self.file.read_exact(&mut trailer).map_err(|e| {
            WalError::CorruptLog(format!("failed to read trailing start offset: {e}"))
        })?;
        let start = u64::from_be_bytes(trailer);
        if start < HEADER_SIZE || start > self.pos.saturating_sub(8) {
            return Err(WalError::CorruptLog(format!(
                "trailing start offset {start} is out of range at position {}",
                self.pos
            )));
        }

        self.file.seek(SeekFrom::Start(start))?;
        let (record, confirmed_start) = LogRecord::decode(&mut self.file)?.ok_or_else(|| {
            WalError::CorruptLog(format!("unexpected end of file scanning backward from {start}"))
        })?;
        if confirmed_start != start {
            return Err(WalError::CorruptLog(format!(
                "record at {start} disagrees with its own trailing start {confirmed_start}"
            )));
        }

        self.pos = start;
        Ok(Some((start, record)))
    }
}
