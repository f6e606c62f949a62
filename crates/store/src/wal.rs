// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Segmented write-ahead log.
//!
//! The log is redo-only: a transaction's operations are appended as one
//! record at commit time, so every record in the log describes a committed
//! transaction and recovery is a single forward scan. Segments are named
//! `log.<seq>` inside the environment home and pruned at checkpoint.
//!
//! ## Record Format
//!
//! ```text
//! ┌──────────────┬───────────────┬───────────────────────────────┐
//! │ len (4B LE)  │ crc32 (4B LE) │ body: kind (1B) + payload     │
//! └──────────────┴───────────────┴───────────────────────────────┘
//! ```
//!
//! - kind 1 (`Txn`): txn id (8B), op count (4B), encoded ops
//! - kind 2 (`Checkpoint`): empty payload, marks a recovery start point
//!
//! A short or checksum-failing record at the tail of the **last** segment is
//! a torn write from a crash: scanning stops there with a warning. The same
//! damage in an earlier segment means lost committed data and is fatal.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::Mutex,
};

use bytes::Bytes;
use snafu::ensure;
use tracing::{debug, info, warn};

use crate::{
    error::{CorruptedSnafu, Result},
    txn::Op,
};

const RECORD_KIND_TXN: u8 = 1;
const RECORD_KIND_CHECKPOINT: u8 = 2;

/// Upper bound on a single record body; larger lengths mean corruption.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

const SEGMENT_PREFIX: &str = "log.";

/// A committed transaction reconstructed from the log during recovery.
pub(crate) struct RecoveredTxn {
    pub id:  u64,
    pub ops: Vec<Op>,
}

struct WalInner {
    writer:  BufWriter<File>,
    seg_no:  u64,
    seg_len: u64,
}

/// Write-ahead log writer over `log.<seq>` segments.
pub(crate) struct Wal {
    home:          PathBuf,
    nosync:        bool,
    segment_bytes: u64,
    buf_capacity:  usize,
    inner:         Mutex<WalInner>,
}

impl Wal {
    /// Scan all existing segments (recovery), then position a writer at a
    /// fresh segment after the last one.
    pub fn open(
        home: &Path,
        segment_bytes: u64,
        buf_capacity: usize,
        nosync: bool,
    ) -> Result<(Self, Vec<RecoveredTxn>)> {
        let segments = list_segments(home)?;

        let mut recovered = Vec::new();
        for (i, (no, path)) in segments.iter().enumerate() {
            let is_last = i + 1 == segments.len();
            scan_segment(path, *no, is_last, &mut recovered)?;
        }

        let seg_no = segments.last().map_or(1, |(no, _)| no + 1);
        let writer = open_segment(home, seg_no, buf_capacity)?;

        info!(
            segments = segments.len(),
            transactions = recovered.len(),
            next_segment = seg_no,
            "write-ahead log opened"
        );

        let wal = Self {
            home: home.to_path_buf(),
            nosync,
            segment_bytes,
            buf_capacity,
            inner: Mutex::new(WalInner {
                writer,
                seg_no,
                seg_len: 0,
            }),
        };
        Ok((wal, recovered))
    }

    /// Append one committed transaction. Durable on return unless the log
    /// was opened with `nosync`.
    pub fn append_commit(&self, txn_id: u64, ops: &[Op]) -> Result<()> {
        let body = encode_txn_body(txn_id, ops);
        let mut inner = self.inner.lock().unwrap();

        let total = 8 + body.len() as u64;
        if inner.seg_len > 0 && inner.seg_len + total > self.segment_bytes {
            self.roll_segment(&mut inner)?;
        }

        write_record(&mut inner.writer, &body)?;
        inner.seg_len += total;

        inner.writer.flush()?;
        if !self.nosync {
            inner.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Establish a checkpoint: roll to a fresh segment, write a checkpoint
    /// record, fsync, and prune every older segment.
    ///
    /// The caller must have flushed all applied state to disk first; the
    /// pruned segments are unrecoverable afterwards.
    pub fn checkpoint(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        self.roll_segment(&mut inner)?;
        write_record(&mut inner.writer, &[RECORD_KIND_CHECKPOINT])?;
        inner.seg_len += 8 + 1;
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;

        let mut pruned = 0usize;
        for (no, path) in list_segments(&self.home)? {
            if no < inner.seg_no {
                fs::remove_file(&path)?;
                pruned += 1;
            }
        }
        debug!(segment = inner.seg_no, pruned, "log checkpoint written");
        Ok(())
    }

    fn roll_segment(&self, inner: &mut WalInner) -> Result<()> {
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;
        inner.seg_no += 1;
        inner.writer = open_segment(&self.home, inner.seg_no, self.buf_capacity)?;
        inner.seg_len = 0;
        Ok(())
    }
}

fn segment_path(home: &Path, no: u64) -> PathBuf { home.join(format!("{SEGMENT_PREFIX}{no:010}")) }

fn open_segment(home: &Path, no: u64, buf_capacity: usize) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o664)
        .open(segment_path(home, no))?;
    Ok(BufWriter::with_capacity(buf_capacity, file))
}

fn list_segments(home: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(home)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(no) = name.strip_prefix(SEGMENT_PREFIX)
            && let Ok(no) = no.parse::<u64>()
        {
            segments.push((no, entry.path()));
        }
    }
    segments.sort_by_key(|(no, _)| *no);
    Ok(segments)
}

fn write_record(writer: &mut BufWriter<File>, body: &[u8]) -> Result<()> {
    let crc = {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        hasher.finalize()
    };
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(body)?;
    Ok(())
}

/// Scan one segment, pushing recovered transactions in commit order.
fn scan_segment(
    path: &Path,
    seg_no: u64,
    is_last: bool,
    out: &mut Vec<RecoveredTxn>,
) -> Result<()> {
    let data = fs::read(path)?;
    let mut pos = 0usize;

    while pos < data.len() {
        if pos + 8 > data.len() {
            ensure!(is_last, CorruptedSnafu {
                reason: format!("log segment {seg_no}: truncated record header at {pos}"),
            });
            warn!(segment = seg_no, pos, "torn record header at log tail");
            break;
        }

        let len = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
        let stored_crc = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap());

        let ok_len = len > 0 && len <= MAX_RECORD_LEN && pos + 8 + len as usize <= data.len();
        if !ok_len {
            ensure!(is_last, CorruptedSnafu {
                reason: format!("log segment {seg_no}: bad record length {len} at {pos}"),
            });
            warn!(segment = seg_no, pos, len, "torn record at log tail");
            break;
        }

        let body = &data[pos + 8..pos + 8 + len as usize];
        let crc = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(body);
            hasher.finalize()
        };
        if crc != stored_crc {
            ensure!(is_last, CorruptedSnafu {
                reason: format!("log segment {seg_no}: checksum mismatch at {pos}"),
            });
            warn!(segment = seg_no, pos, "checksum mismatch at log tail");
            break;
        }

        match body[0] {
            RECORD_KIND_TXN => out.push(decode_txn_body(&body[1..])?),
            RECORD_KIND_CHECKPOINT => {}
            other => {
                return CorruptedSnafu {
                    reason: format!("log segment {seg_no}: unknown record kind {other}"),
                }
                .fail();
            }
        }

        pos += 8 + len as usize;
    }

    Ok(())
}

// Op encoding tags.
const OP_TABLE_PUT: u8 = 1;
const OP_TABLE_DEL: u8 = 2;
const OP_FIFO_CREATE: u8 = 3;
const OP_FIFO_APPEND: u8 = 4;
const OP_FIFO_CONSUME: u8 = 5;
const OP_FIFO_REMOVE: u8 = 6;

fn encode_txn_body(txn_id: u64, ops: &[Op]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.push(RECORD_KIND_TXN);
    buf.extend_from_slice(&txn_id.to_le_bytes());
    buf.extend_from_slice(&(ops.len() as u32).to_le_bytes());
    for op in ops {
        encode_op(&mut buf, op);
    }
    buf
}

fn encode_op(buf: &mut Vec<u8>, op: &Op) {
    match op {
        Op::TablePut { table, key, value } => {
            buf.push(OP_TABLE_PUT);
            put_str(buf, table);
            put_bytes16(buf, key);
            put_bytes32(buf, value);
        }
        Op::TableDel { table, key } => {
            buf.push(OP_TABLE_DEL);
            put_str(buf, table);
            put_bytes16(buf, key);
        }
        Op::FifoCreate {
            file,
            record_length,
            extent_size,
        } => {
            buf.push(OP_FIFO_CREATE);
            put_str(buf, file);
            buf.extend_from_slice(&record_length.to_le_bytes());
            buf.extend_from_slice(&extent_size.to_le_bytes());
        }
        Op::FifoAppend { file, recno, data } => {
            buf.push(OP_FIFO_APPEND);
            put_str(buf, file);
            buf.extend_from_slice(&recno.to_le_bytes());
            put_bytes32(buf, data);
        }
        Op::FifoConsume { file, recno } => {
            buf.push(OP_FIFO_CONSUME);
            put_str(buf, file);
            buf.extend_from_slice(&recno.to_le_bytes());
        }
        Op::FifoRemove { file } => {
            buf.push(OP_FIFO_REMOVE);
            put_str(buf, file);
        }
    }
}

fn decode_txn_body(body: &[u8]) -> Result<RecoveredTxn> {
    let mut r = Reader::new(body);
    let id = r.u64()?;
    let count = r.u32()? as usize;
    let mut ops = Vec::with_capacity(count);
    for _ in 0..count {
        ops.push(decode_op(&mut r)?);
    }
    Ok(RecoveredTxn { id, ops })
}

fn decode_op(r: &mut Reader<'_>) -> Result<Op> {
    let tag = r.u8()?;
    let op = match tag {
        OP_TABLE_PUT => Op::TablePut {
            table: r.string()?,
            key:   r.bytes16()?,
            value: r.bytes32()?,
        },
        OP_TABLE_DEL => Op::TableDel {
            table: r.string()?,
            key:   r.bytes16()?,
        },
        OP_FIFO_CREATE => Op::FifoCreate {
            file:          r.string()?,
            record_length: r.u32()?,
            extent_size:   r.u32()?,
        },
        OP_FIFO_APPEND => Op::FifoAppend {
            file:  r.string()?,
            recno: r.u32()?,
            data:  Bytes::from(r.bytes32()?),
        },
        OP_FIFO_CONSUME => Op::FifoConsume {
            file:  r.string()?,
            recno: r.u32()?,
        },
        OP_FIFO_REMOVE => Op::FifoRemove { file: r.string()? },
        other => {
            return CorruptedSnafu {
                reason: format!("unknown op tag {other} in log record"),
            }
            .fail();
        }
    };
    Ok(op)
}

fn put_str(buf: &mut Vec<u8>, s: &str) { put_bytes16(buf, s.as_bytes()) }

fn put_bytes16(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u16).to_le_bytes());
    buf.extend_from_slice(b);
}

fn put_bytes32(buf: &mut Vec<u8>, b: &[u8]) {
    buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
    buf.extend_from_slice(b);
}

struct Reader<'a> {
    data: &'a [u8],
    pos:  usize,
}

impl<'a> Reader<'a> {
    const fn new(data: &'a [u8]) -> Self { Self { data, pos: 0 } }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(self.pos + n <= self.data.len(), CorruptedSnafu {
            reason: format!("log record shorter than declared ({} bytes)", self.data.len()),
        });
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> { Ok(self.take(1)?[0]) }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes16(&mut self) -> Result<Vec<u8>> {
        let len = u16::from_le_bytes(self.take(2)?.try_into().unwrap()) as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn bytes32(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String> {
        let raw = self.bytes16()?;
        String::from_utf8(raw).map_err(|_| {
            CorruptedSnafu {
                reason: "non-utf8 container name in log record".to_string(),
            }
            .build()
        })
    }
}
