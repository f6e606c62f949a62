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

//! Fixed-record FIFO files.
//!
//! One file per queue. Records are fixed-width slots addressed by a
//! monotonically increasing 32-bit record number assigned at append; consume
//! always takes the smallest live record number. Payloads shorter than the
//! record length are zero-padded, longer ones are rejected.
//!
//! ## File Format
//!
//! ```text
//! page 0 (meta):
//! ┌─────────────────┬───────────────────────────────────────┐
//! │ magic: [u8; 4]  │ "QREC"                                │
//! │ version: u32    │ format version, currently 1           │
//! │ re_len: u32     │ record payload width in bytes         │
//! │ extent: u32     │ extent size in records, 0 = none      │
//! │ base: u32       │ recno of the first slot in the file   │
//! │ head: u32       │ smallest live recno                   │
//! │ tail: u32       │ next recno to assign                  │
//! │ checksum: u32   │ CRC32 of the fields above             │
//! └─────────────────┴───────────────────────────────────────┘
//! pages 1..: slots of [len u32][payload padded to re_len]
//! ```
//!
//! Slot offsets are relative to `base`: when the queue drains completely the
//! file is truncated back to the meta page and `base` jumps to `tail`, which
//! reclaims fully consumed extents while record numbers stay monotonic.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use snafu::ensure;

use crate::{
    env::EnvInner,
    error::{CorruptedSnafu, NotFoundSnafu, RecordTooLongSnafu, Result},
    lock::{LockMode, Resource},
    pool::{BufferPool, FileId, PageId},
    txn::{Op, Txn},
};

pub(crate) const FIFO_MAGIC: [u8; 4] = *b"QREC";
pub(crate) const FIFO_VERSION: u32 = 1;
const FIFO_META_SIZE: usize = 32;

/// First record number ever assigned in a fresh file.
const FIRST_RECNO: u32 = 1;

/// Per-file parameters, fixed at creation.
#[derive(Clone, Copy, Debug)]
pub struct FifoParams {
    /// Payload width of every record, in bytes.
    pub record_length: u32,
    /// Growth unit in records; 0 disables extent preallocation.
    pub extent_size:   u32,
}

impl Default for FifoParams {
    fn default() -> Self {
        Self {
            record_length: 1024,
            extent_size:   131_072,
        }
    }
}

pub(crate) struct FifoMeta {
    pub base: u32,
    pub head: u32,
    pub tail: u32,
}

/// Resident state of one FIFO file.
pub(crate) struct FifoFile {
    pub name:        String,
    pub file:        FileId,
    pub re_len:      u32,
    pub extent_size: u32,
    pub meta:        Mutex<FifoMeta>,
}

impl FifoFile {
    /// Open a FIFO file through the pool, creating and initializing it when
    /// `create` is set. Re-opening an initialized file reads its parameters
    /// from the meta page; the caller's params only seed a fresh file.
    pub fn open(
        pool: &BufferPool,
        path: &std::path::Path,
        name: &str,
        params: FifoParams,
        create: bool,
    ) -> Result<Arc<Self>> {
        let file = pool.open_file(path, create, crate::pool::Priority::Normal)?;

        let raw = pool.with_page(PageId { file, page: 0 }, |p| {
            let mut m = [0u8; FIFO_META_SIZE];
            m.copy_from_slice(&p[..FIFO_META_SIZE]);
            m
        })?;

        let (re_len, extent_size, meta) = if raw == [0u8; FIFO_META_SIZE] {
            // Fresh file.
            let meta = FifoMeta {
                base: FIRST_RECNO,
                head: FIRST_RECNO,
                tail: FIRST_RECNO,
            };
            write_meta_page(pool, file, params.record_length, params.extent_size, &meta)?;
            (params.record_length, params.extent_size, meta)
        } else {
            ensure!(raw[0..4] == FIFO_MAGIC, CorruptedSnafu {
                reason: format!("record file {name}: bad magic"),
            });
            let version = u32::from_le_bytes(raw[4..8].try_into().unwrap());
            ensure!(version == FIFO_VERSION, CorruptedSnafu {
                reason: format!("record file {name}: unsupported version {version}"),
            });
            let stored_crc = u32::from_le_bytes(raw[28..32].try_into().unwrap());
            let crc = {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(&raw[0..28]);
                hasher.finalize()
            };
            ensure!(crc == stored_crc, CorruptedSnafu {
                reason: format!("record file {name}: meta checksum mismatch"),
            });

            let re_len = u32::from_le_bytes(raw[8..12].try_into().unwrap());
            let extent = u32::from_le_bytes(raw[12..16].try_into().unwrap());
            let meta = FifoMeta {
                base: u32::from_le_bytes(raw[16..20].try_into().unwrap()),
                head: u32::from_le_bytes(raw[20..24].try_into().unwrap()),
                tail: u32::from_le_bytes(raw[24..28].try_into().unwrap()),
            };
            (re_len, extent, meta)
        };

        Ok(Arc::new(Self {
            name: name.to_string(),
            file,
            re_len,
            extent_size,
            meta: Mutex::new(meta),
        }))
    }

    /// Number of live records.
    pub fn live_records(&self) -> u64 {
        let meta = self.meta.lock().unwrap();
        u64::from(meta.tail - meta.head)
    }

    const fn slot_len(&self) -> usize { 4 + self.re_len as usize }

    fn slots_per_page(&self, pool: &BufferPool) -> u32 {
        (pool.page_size() / self.slot_len()).max(1) as u32
    }

    fn slot_position(&self, pool: &BufferPool, base: u32, recno: u32) -> (u32, usize) {
        let spp = self.slots_per_page(pool);
        let index = recno - base;
        (1 + index / spp, (index % spp) as usize * self.slot_len())
    }

    /// Committed-state apply of one append. Replay-safe: a record number
    /// below `base` was already consumed and reclaimed.
    pub fn apply_append(&self, pool: &BufferPool, recno: u32, data: &[u8]) -> Result<()> {
        let mut meta = self.meta.lock().unwrap();
        if recno < meta.base {
            return Ok(());
        }

        if self.extent_size > 0 {
            let spp = self.slots_per_page(pool);
            let extent_pages = self.extent_size.div_ceil(spp);
            let data_pages = (recno - meta.base) / spp + 1;
            let rounded = data_pages.div_ceil(extent_pages) * extent_pages;
            pool.extend_file(self.file, 1 + rounded)?;
        }

        let (page, offset) = self.slot_position(pool, meta.base, recno);
        let slot_len = self.slot_len();
        pool.with_page_mut(PageId { file: self.file, page }, |p| {
            let slot = &mut p[offset..offset + slot_len];
            slot.fill(0);
            slot[0..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
            slot[4..4 + data.len()].copy_from_slice(data);
        })?;

        meta.tail = meta.tail.max(recno + 1);
        write_meta_page(pool, self.file, self.re_len, self.extent_size, &meta)
    }

    /// Committed-state apply of one consume. When the last live record goes,
    /// the data pages are reclaimed and `base` advances to `tail`.
    pub fn apply_consume(&self, pool: &BufferPool, recno: u32) -> Result<()> {
        let mut meta = self.meta.lock().unwrap();
        if recno < meta.base {
            return Ok(());
        }

        meta.head = meta.head.max(recno + 1);
        if meta.head >= meta.tail && meta.tail > meta.base {
            meta.head = meta.tail;
            meta.base = meta.tail;
            pool.truncate_file(self.file, 1)?;
        }
        write_meta_page(pool, self.file, self.re_len, self.extent_size, &meta)
    }

    /// Read the payload stored at `recno`.
    pub fn read_record(&self, pool: &BufferPool, recno: u32) -> Result<Bytes> {
        let meta = self.meta.lock().unwrap();
        ensure!(recno >= meta.base && recno < meta.tail, NotFoundSnafu);

        let (page, offset) = self.slot_position(pool, meta.base, recno);
        let slot_len = self.slot_len();
        let re_len = self.re_len;
        let name = self.name.clone();
        pool.with_page(PageId { file: self.file, page }, move |p| {
            let slot = &p[offset..offset + slot_len];
            let len = u32::from_le_bytes(slot[0..4].try_into().unwrap());
            ensure!(len <= re_len, CorruptedSnafu {
                reason: format!("record file {name}: slot length {len} exceeds {re_len}"),
            });
            Ok(Bytes::copy_from_slice(&slot[4..4 + len as usize]))
        })?
    }
}

fn write_meta_page(
    pool: &BufferPool,
    file: FileId,
    re_len: u32,
    extent_size: u32,
    meta: &FifoMeta,
) -> Result<()> {
    let mut raw = [0u8; FIFO_META_SIZE];
    raw[0..4].copy_from_slice(&FIFO_MAGIC);
    raw[4..8].copy_from_slice(&FIFO_VERSION.to_le_bytes());
    raw[8..12].copy_from_slice(&re_len.to_le_bytes());
    raw[12..16].copy_from_slice(&extent_size.to_le_bytes());
    raw[16..20].copy_from_slice(&meta.base.to_le_bytes());
    raw[20..24].copy_from_slice(&meta.head.to_le_bytes());
    raw[24..28].copy_from_slice(&meta.tail.to_le_bytes());
    let crc = {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&raw[0..28]);
        hasher.finalize()
    };
    raw[28..32].copy_from_slice(&crc.to_le_bytes());

    pool.with_page_mut(PageId { file, page: 0 }, |p| {
        p[..FIFO_META_SIZE].copy_from_slice(&raw);
    })
}

/// Transactional handle to a FIFO file.
///
/// The handle carries the queue name; the open container is resolved
/// through the environment's registry on every operation, so a handle
/// stays valid across the create-inside-transaction window.
#[derive(Clone)]
pub struct FifoHandle {
    pub(crate) env:    Arc<EnvInner>,
    pub(crate) name:   String,
    pub(crate) params: FifoParams,
}

impl std::fmt::Debug for FifoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FifoHandle")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

impl FifoHandle {
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Append one record; the assigned record number is returned and the
    /// record becomes durable at commit.
    pub fn append(&self, txn: &mut Txn, data: &[u8]) -> Result<u32> {
        self.env
            .locks
            .acquire(txn.id, &Resource::File(self.name.clone()), LockMode::Exclusive)?;

        let (re_len, committed_tail) = match self.env.fifo_get(&self.name) {
            Some(fifo) => (fifo.re_len, fifo.meta.lock().unwrap().tail),
            None => {
                ensure!(txn.pending_fifo_created(&self.name), NotFoundSnafu);
                (self.params.record_length, FIRST_RECNO)
            }
        };

        ensure!(data.len() <= re_len as usize, RecordTooLongSnafu {
            len:           data.len(),
            record_length: re_len,
        });

        let recno = committed_tail + txn.pending_appends(&self.name);
        txn.record(Op::FifoAppend {
            file:  self.name.clone(),
            recno,
            data:  Bytes::copy_from_slice(data),
        });
        Ok(recno)
    }

    /// Atomically read and remove the record with the smallest live record
    /// number. `Ok(None)` when the queue is empty; the removal is durable at
    /// commit.
    pub fn consume(&self, txn: &mut Txn) -> Result<Option<Bytes>> {
        self.env
            .locks
            .acquire(txn.id, &Resource::File(self.name.clone()), LockMode::Exclusive)?;

        let resolved = self.env.fifo_get(&self.name);
        let (head, tail) = match &resolved {
            Some(fifo) => {
                let meta = fifo.meta.lock().unwrap();
                (meta.head, meta.tail)
            }
            None => {
                ensure!(txn.pending_fifo_created(&self.name), NotFoundSnafu);
                (FIRST_RECNO, FIRST_RECNO)
            }
        };

        let recno = head + txn.pending_consumes(&self.name);
        let effective_tail = tail + txn.pending_appends(&self.name);
        if recno >= effective_tail {
            return Ok(None);
        }

        let data = if recno >= tail {
            // Reading back a record this transaction appended.
            txn.pending_append_data(&self.name, recno)
                .ok_or_else(|| CorruptedSnafu {
                    reason: format!("record file {}: missing pending record {recno}", self.name),
                }
                .build())?
        } else {
            let fifo = resolved.ok_or_else(|| NotFoundSnafu.build())?;
            fifo.read_record(&self.env.pool, recno)?
        };

        txn.record(Op::FifoConsume {
            file:  self.name.clone(),
            recno,
        });
        Ok(Some(data))
    }
}
