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

//! Ordered key/value table.
//!
//! A table lives in a single page-structured file. The resident form is a
//! `BTreeMap`; durability comes from the write-ahead log, and the map is
//! serialized back through the buffer pool at checkpoint and close.
//!
//! ## File Format
//!
//! ```text
//! page 0 (header):
//! ┌─────────────────┬───────────────────────────────────────┐
//! │ magic: [u8; 4]  │ "QTBL"                                │
//! │ version: u32    │ format version, currently 1           │
//! │ entries: u32    │ number of key/value pairs             │
//! │ payload: u64    │ payload length in bytes               │
//! │ checksum: u32   │ CRC32 of the payload                  │
//! └─────────────────┴───────────────────────────────────────┘
//! pages 1..: payload, [klen u16][key][vlen u32][value] in key order
//! ```
//!
//! An all-zero header page is a freshly created, empty table.

use std::{collections::BTreeMap, sync::Mutex};

use bytes::Bytes;
use snafu::ensure;

use crate::{
    env::EnvInner,
    error::{CorruptedSnafu, KeyExistsSnafu, NotFoundSnafu, Result},
    lock::{LockMode, Resource},
    pool::{BufferPool, FileId, PageId},
    txn::{Op, Txn},
};

pub(crate) const TABLE_MAGIC: [u8; 4] = *b"QTBL";
pub(crate) const TABLE_VERSION: u32 = 1;
const TABLE_HEADER_SIZE: usize = 24;

#[derive(Debug)]
pub(crate) struct TableData {
    pub entries: BTreeMap<Vec<u8>, Vec<u8>>,
    pub dirty:   bool,
}

/// Resident state of one table.
#[derive(Debug)]
pub(crate) struct Table {
    pub name:  String,
    pub file:  FileId,
    pub state: Mutex<TableData>,
}

impl Table {
    /// Load a table from its file; an all-zero header page means a fresh
    /// table.
    pub fn load(pool: &BufferPool, file: FileId, name: &str) -> Result<Self> {
        let page_size = pool.page_size();

        let header = pool.with_page(PageId { file, page: 0 }, |p| {
            let mut h = [0u8; TABLE_HEADER_SIZE];
            h.copy_from_slice(&p[..TABLE_HEADER_SIZE]);
            h
        })?;

        let mut entries = BTreeMap::new();
        if header != [0u8; TABLE_HEADER_SIZE] {
            ensure!(header[0..4] == TABLE_MAGIC, CorruptedSnafu {
                reason: format!("table {name}: bad magic"),
            });
            let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
            ensure!(version == TABLE_VERSION, CorruptedSnafu {
                reason: format!("table {name}: unsupported version {version}"),
            });
            let count = u32::from_le_bytes(header[8..12].try_into().unwrap());
            let payload_len = u64::from_le_bytes(header[12..20].try_into().unwrap()) as usize;
            let stored_crc = u32::from_le_bytes(header[20..24].try_into().unwrap());

            let mut payload = vec![0u8; payload_len];
            let mut copied = 0usize;
            let mut page = 1u32;
            while copied < payload_len {
                let n = (payload_len - copied).min(page_size);
                pool.with_page(PageId { file, page }, |p| {
                    payload[copied..copied + n].copy_from_slice(&p[..n]);
                })?;
                copied += n;
                page += 1;
            }

            let crc = {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(&payload);
                hasher.finalize()
            };
            ensure!(crc == stored_crc, CorruptedSnafu {
                reason: format!("table {name}: checksum mismatch"),
            });

            entries = parse_entries(&payload, count as usize, name)?;
        }

        Ok(Self {
            name:  name.to_string(),
            file,
            state: Mutex::new(TableData {
                entries,
                dirty: false,
            }),
        })
    }

    /// Serialize the map back into the table's pages if it changed.
    pub fn flush(&self, pool: &BufferPool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.dirty {
            return Ok(());
        }

        let page_size = pool.page_size();
        let mut payload = Vec::new();
        for (k, v) in &state.entries {
            payload.extend_from_slice(&(k.len() as u16).to_le_bytes());
            payload.extend_from_slice(k);
            payload.extend_from_slice(&(v.len() as u32).to_le_bytes());
            payload.extend_from_slice(v);
        }
        let crc = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&payload);
            hasher.finalize()
        };

        let mut header = [0u8; TABLE_HEADER_SIZE];
        header[0..4].copy_from_slice(&TABLE_MAGIC);
        header[4..8].copy_from_slice(&TABLE_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&(state.entries.len() as u32).to_le_bytes());
        header[12..20].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        header[20..24].copy_from_slice(&crc.to_le_bytes());

        let payload_pages = payload.len().div_ceil(page_size) as u32;
        pool.truncate_file(self.file, 1 + payload_pages)?;

        pool.with_page_mut(PageId { file: self.file, page: 0 }, |p| {
            p.fill(0);
            p[..TABLE_HEADER_SIZE].copy_from_slice(&header);
        })?;

        for page in 0..payload_pages {
            let start = page as usize * page_size;
            let n = (payload.len() - start).min(page_size);
            pool.with_page_mut(
                PageId {
                    file: self.file,
                    page: page + 1,
                },
                |p| {
                    p.fill(0);
                    p[..n].copy_from_slice(&payload[start..start + n]);
                },
            )?;
        }

        state.dirty = false;
        Ok(())
    }

    pub fn apply_put(&self, key: &[u8], value: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.entries.insert(key.to_vec(), value.to_vec());
        state.dirty = true;
    }

    pub fn apply_del(&self, key: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.entries.remove(key);
        state.dirty = true;
    }
}

fn parse_entries(
    payload: &[u8],
    count: usize,
    name: &str,
) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    let mut entries = BTreeMap::new();
    let mut pos = 0usize;
    for _ in 0..count {
        ensure!(pos + 2 <= payload.len(), CorruptedSnafu {
            reason: format!("table {name}: truncated entry"),
        });
        let klen = u16::from_le_bytes(payload[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        ensure!(pos + klen + 4 <= payload.len(), CorruptedSnafu {
            reason: format!("table {name}: truncated key"),
        });
        let key = payload[pos..pos + klen].to_vec();
        pos += klen;
        let vlen = u32::from_le_bytes(payload[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        ensure!(pos + vlen <= payload.len(), CorruptedSnafu {
            reason: format!("table {name}: truncated value"),
        });
        entries.insert(key, payload[pos..pos + vlen].to_vec());
        pos += vlen;
    }
    Ok(entries)
}

/// Transactional handle to an open table.
#[derive(Clone)]
pub struct TableHandle {
    pub(crate) env:   std::sync::Arc<EnvInner>,
    pub(crate) table: std::sync::Arc<Table>,
}

impl TableHandle {
    #[must_use]
    pub fn name(&self) -> &str { &self.table.name }

    /// Read a key under a shared entry lock. Absent keys are `Ok(None)`.
    pub fn get(&self, txn: &mut Txn, key: &[u8]) -> Result<Option<Bytes>> {
        self.get_locked(txn, key, LockMode::Shared)
    }

    /// Read a key under an exclusive entry lock, for read-modify-write
    /// cycles that will put the same key before committing.
    pub fn get_for_update(&self, txn: &mut Txn, key: &[u8]) -> Result<Option<Bytes>> {
        self.get_locked(txn, key, LockMode::Exclusive)
    }

    fn get_locked(&self, txn: &mut Txn, key: &[u8], mode: LockMode) -> Result<Option<Bytes>> {
        self.env.locks.acquire(txn.id, &self.entry(key), mode)?;

        if let Some(pending) = txn.pending_table_get(&self.table.name, key) {
            return Ok(pending.map(Bytes::copy_from_slice));
        }
        let state = self.table.state.lock().unwrap();
        Ok(state.entries.get(key).map(|v| Bytes::copy_from_slice(v)))
    }

    /// Upsert a key. Inserting a new key additionally locks the whole
    /// table so cursors cannot run concurrently with inserts.
    pub fn put(&self, txn: &mut Txn, key: &[u8], value: &[u8]) -> Result<()> {
        self.env
            .locks
            .acquire(txn.id, &self.entry(key), LockMode::Exclusive)?;
        if !self.exists(txn, key) {
            self.env
                .locks
                .acquire(txn.id, &self.whole(), LockMode::Exclusive)?;
        }
        txn.record(Op::TablePut {
            table: self.table.name.clone(),
            key:   key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Insert a new key; an existing one is `KeyExists`.
    pub fn insert(&self, txn: &mut Txn, key: &[u8], value: &[u8]) -> Result<()> {
        self.env
            .locks
            .acquire(txn.id, &self.entry(key), LockMode::Exclusive)?;
        ensure!(!self.exists(txn, key), KeyExistsSnafu);
        self.env
            .locks
            .acquire(txn.id, &self.whole(), LockMode::Exclusive)?;
        txn.record(Op::TablePut {
            table: self.table.name.clone(),
            key:   key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Delete a key; an absent one is `NotFound`.
    pub fn delete(&self, txn: &mut Txn, key: &[u8]) -> Result<()> {
        self.env
            .locks
            .acquire(txn.id, &self.entry(key), LockMode::Exclusive)?;
        ensure!(self.exists(txn, key), NotFoundSnafu);
        self.env
            .locks
            .acquire(txn.id, &self.whole(), LockMode::Exclusive)?;
        txn.record(Op::TableDel {
            table: self.table.name.clone(),
            key:   key.to_vec(),
        });
        Ok(())
    }

    /// Cursor over all entries in key order under a shared table lock.
    ///
    /// The visitor returns `Ok(true)` to continue, `Ok(false)` to stop
    /// early. The iteration observes this transaction's pending writes.
    pub fn for_each(
        &self,
        txn: &mut Txn,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<bool>,
    ) -> Result<()> {
        self.env
            .locks
            .acquire(txn.id, &self.whole(), LockMode::Shared)?;

        let mut snapshot = {
            let state = self.table.state.lock().unwrap();
            state.entries.clone()
        };
        for op in &txn.ops {
            match op {
                Op::TablePut { table, key, value } if *table == self.table.name => {
                    snapshot.insert(key.clone(), value.clone());
                }
                Op::TableDel { table, key } if *table == self.table.name => {
                    snapshot.remove(key);
                }
                _ => {}
            }
        }

        for (key, value) in &snapshot {
            self.env
                .locks
                .acquire(txn.id, &self.entry(key), LockMode::Shared)?;
            if !visit(key, value)? {
                break;
            }
        }
        Ok(())
    }

    fn exists(&self, txn: &Txn, key: &[u8]) -> bool {
        if let Some(pending) = txn.pending_table_get(&self.table.name, key) {
            return pending.is_some();
        }
        self.table.state.lock().unwrap().entries.contains_key(key)
    }

    fn entry(&self, key: &[u8]) -> Resource {
        Resource::Entry {
            file: self.table.name.clone(),
            key:  key.to_vec(),
        }
    }

    fn whole(&self) -> Resource { Resource::File(self.table.name.clone()) }
}
