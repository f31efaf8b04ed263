//! The on-disk log-record format (spec §3/§6), byte-exact, big-endian.
//!
//! ```text
//! record     := BEGIN_REC | COMMIT_REC | ABORT_REC | UPDATE_REC | CHECKPOINT_REC
//! BEGIN_REC  := 4:i32 tid:i64 start:i64
//! COMMIT_REC := 2:i32 tid:i64 start:i64
//! ABORT_REC  := 1:i32 tid:i64 start:i64
//! UPDATE_REC := 3:i32 tid:i64 page_image page_image start:i64
//! page_image := pageClass:utf idClass:utf n:i32 id_ints:i32×n data_len:i32 data:bytes
//! CHECKPOINT_REC := 5:i32 (-1):i64 count:i32 (tid:i64 first_off:i64)×count start:i64
//! ```
//!
//! Every record ends with its own starting offset, so the log can be read
//! backward (spec §3 invariant 2). Tags are not sequential on purpose: this
//! crate preserves the exact numbering spec.md assigns each kind.

use std::io::{self, Read};

use crate::error::{Result, WalError};
use crate::page_store::PageId;

pub type Tid = u64;

const TAG_ABORT: i32 = 1;
const TAG_COMMIT: i32 = 2;
const TAG_UPDATE: i32 = 3;
const TAG_BEGIN: i32 = 4;
const TAG_CHECKPOINT: i32 = 5;

/// One logged page image: the type tags needed to reconstruct the page and
/// its id through a [`crate::page_store::PageStore`] registry (spec §9),
/// the id itself, and the raw page bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageImage {
    pub page_tag: String,
    pub id_tag: String,
    pub id: PageId,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogRecord {
    Begin {
        tid: Tid,
    },
    Commit {
        tid: Tid,
    },
    Abort {
        tid: Tid,
    },
    Update {
        tid: Tid,
        before: PageImage,
        after: PageImage,
    },
    /// `entries` is `(tid, first_log_record_offset)` for every transaction
    /// live at checkpoint time.
    Checkpoint {
        entries: Vec<(Tid, u64)>,
    },
}

impl LogRecord {
    pub fn tid(&self) -> Option<Tid> {
        match self {
            LogRecord::Begin { tid }
            | LogRecord::Commit { tid }
            | LogRecord::Abort { tid }
            | LogRecord::Update { tid, .. } => Some(*tid),
            LogRecord::Checkpoint { .. } => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            LogRecord::Begin { .. } => "BEGIN",
            LogRecord::Commit { .. } => "COMMIT",
            LogRecord::Abort { .. } => "ABORT",
            LogRecord::Update { .. } => "UPDATE",
            LogRecord::Checkpoint { .. } => "CHECKPOINT",
        }
    }

    /// Encode this record for appending at `start` (its own offset in the
    /// file). The returned bytes include the trailing start offset.
    pub fn encode(&self, start: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            LogRecord::Begin { tid } => {
                write_i32(&mut buf, TAG_BEGIN);
                write_i64(&mut buf, *tid as i64);
            }
            LogRecord::Commit { tid } => {
                write_i32(&mut buf, TAG_COMMIT);
                write_i64(&mut buf, *tid as i64);
            }
            LogRecord::Abort { tid } => {
                write_i32(&mut buf, TAG_ABORT);
                write_i64(&mut buf, *tid as i64);
            }
            LogRecord::Update { tid, before, after } => {
                write_i32(&mut buf, TAG_UPDATE);
                write_i64(&mut buf, *tid as i64);
                write_page_image(&mut buf, before);
                write_page_image(&mut buf, after);
            }
            LogRecord::Checkpoint { entries } => {
                write_i32(&mut buf, TAG_CHECKPOINT);
                write_i64(&mut buf, -1);
                write_i32(&mut buf, entries.len() as i32);
                for (tid, off) in entries {
                    write_i64(&mut buf, *tid as i64);
                    write_i64(&mut buf, *off as i64);
                }
            }
        }
        write_i64(&mut buf, start as i64);
        buf
    }

    /// Read one record starting at the current reader position. Returns
    /// `Ok(None)` only when the reader was exactly at a record boundary and
    /// is at clean end-of-file; any other truncation is `CorruptLog` (spec
    /// §4.1/§7: unexpected EOF inside a record is fatal).
    pub fn decode(r: &mut impl Read) -> Result<Option<(LogRecord, u64)>> {
        let mut kind_buf = [0u8; 4];
        if !read_may_be_eof(r, &mut kind_buf)? {
            return Ok(None);
        }
        let kind = i32::from_be_bytes(kind_buf);
        let record = match kind {
            TAG_ABORT => LogRecord::Abort {
                tid: read_i64(r)? as u64,
            },
            TAG_COMMIT => LogRecord::Commit {
                tid: read_i64(r)? as u64,
            },
            TAG_BEGIN => LogRecord::Begin {
                tid: read_i64(r)? as u64,
            },
            TAG_UPDATE => {
                let tid = read_i64(r)? as u64;
                let before = read_page_image(r)?;
                let after = read_page_image(r)?;
                LogRecord::Update { tid, before, after }
            }
            TAG_CHECKPOINT => {
                let placeholder = read_i64(r)?;
                if placeholder != -1 {
                    return Err(WalError::CorruptLog(format!(
                        "checkpoint record placeholder tid is {placeholder}, expected -1"
                    )));
                }
                let count = read_i32(r)?;
                if count < 0 {
                    return Err(WalError::CorruptLog(format!(
                        "checkpoint record has negative entry count {count}"
                    )));
                }
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let tid = read_i64(r)? as u64;
                    let off = read_i64(r)? as u64;
                    entries.push((tid, off));
                }
                LogRecord::Checkpoint { entries }
            }
            other => {
                return Err(WalError::CorruptLog(format!(
                    "unrecognized log record kind tag {other}"
                )))
            }
        };
        let start = read_i64(r)? as u64;
        Ok(Some((record, start)))
    }
}

fn write_page_image(buf: &mut Vec<u8>, image: &PageImage) {
    write_utf(buf, &image.page_tag);
    write_utf(buf, &image.id_tag);
    write_i32(buf, image.id.ints().len() as i32);
    for i in image.id.ints() {
        write_i32(buf, *i);
    }
    write_i32(buf, image.data.len() as i32);
    buf.extend_from_slice(&image.data);
}

fn read_page_image(r: &mut impl Read) -> Result<PageImage> {
    let page_tag = read_utf(r)?;
    let id_tag = read_utf(r)?;
    let n = read_i32(r)?;
    if n < 0 {
        return Err(WalError::CorruptLog(format!(
            "page image has negative id-int count {n}"
        )));
    }
    let mut ints = Vec::with_capacity(n as usize);
    for _ in 0..n {
        ints.push(read_i32(r)?);
    }
    let data_len = read_i32(r)?;
    if data_len < 0 {
        return Err(WalError::CorruptLog(format!(
            "page image has negative data length {data_len}"
        )));
    }
    let mut data = vec![0u8; data_len as usize];
    read_exact_mid(r, &mut data)?;
    Ok(PageImage {
        page_tag,
        id_tag,
        id: PageId(ints),
        data,
    })
}

fn write_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn write_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn write_utf(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn read_i32(r: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    read_exact_mid(r, &mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

fn read_i64(r: &mut impl Read) -> Result<i64> {
    let mut buf = [0u8; 8];
    read_exact_mid(r, &mut buf)?;
    Ok(i64::from_be_bytes(buf))
}

fn read_utf(r: &mut impl Read) -> Result<String> {
    let mut len_buf = [0u8; 2];
    read_exact_mid(r, &mut len_buf)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut bytes = vec![0u8; len];
    read_exact_mid(r, &mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| WalError::CorruptLog(format!("page image tag is not valid UTF-8: {e}")))
}

/// Reads exactly `buf.len()` bytes. Any short read (including zero bytes)
/// is a corrupt/truncated record, since the caller is already mid-record.
fn read_exact_mid(r: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    match r.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(WalError::CorruptLog(
            "unexpected end of file inside a log record".to_string(),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Reads exactly `buf.len()` bytes, distinguishing a clean end-of-file at a
/// record boundary (returns `Ok(false)`, buffer partially/not filled) from
/// a genuine I/O error or a torn read that started but didn't finish
/// (`CorruptLog`).
fn read_may_be_eof(r: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut total = 0usize;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => {
                if total == 0 {
                    return Ok(false);
                }
                return Err(WalError::CorruptLog(
                    "truncated record header at end of file".to_string(),
                ));
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}
