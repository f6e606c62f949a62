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

//! Transactions.
//!
//! A [`Txn`] buffers all of its mutations as logical operations and applies
//! nothing to the shared state until [`Txn::commit`]. Commit appends the
//! whole write set to the log as one record, applies it, and releases the
//! transaction's locks. Abort (explicit or by dropping the handle) discards
//! the write set — there is never anything to undo.
//!
//! Reads made through a transaction observe its own uncommitted write set
//! first (read-your-writes); the helpers at the bottom of this module
//! implement that overlay for tables and FIFO files.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytes::Bytes;

use crate::{
    env::EnvInner,
    error::{Result, TooManyTransactionsSnafu},
    lock::TxnId,
};

/// A logical operation in a transaction's write set.
///
/// Each variant replays idempotently: table mutations are set/delete,
/// FIFO record numbers carry their own position, and create/remove are
/// if-absent/if-present.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    TablePut {
        table: String,
        key:   Vec<u8>,
        value: Vec<u8>,
    },
    TableDel {
        table: String,
        key:   Vec<u8>,
    },
    FifoCreate {
        file:          String,
        record_length: u32,
        extent_size:   u32,
    },
    FifoAppend {
        file:  String,
        recno: u32,
        data:  Bytes,
    },
    FifoConsume {
        file:  String,
        recno: u32,
    },
    FifoRemove {
        file: String,
    },
}

/// An open transaction against the environment.
///
/// Dropping a transaction that was neither committed nor aborted aborts it.
pub struct Txn {
    pub(crate) env:      Arc<EnvInner>,
    pub(crate) id:       TxnId,
    pub(crate) ops:      Vec<Op>,
    pub(crate) finished: bool,
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("ops", &self.ops)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Txn {
    /// The transaction's id. Ids increase in begin order; the deadlock
    /// detector's "youngest" victim is the largest id in a cycle.
    #[must_use]
    pub const fn id(&self) -> TxnId { self.id }

    /// Commit: write-ahead log the write set, apply it, release locks.
    ///
    /// # Errors
    ///
    /// Propagates log and apply failures. The transaction is finished
    /// either way; on error nothing of the write set became visible.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let ops = std::mem::take(&mut self.ops);
        let env = Arc::clone(&self.env);
        env.commit_txn(self.id, ops)
    }

    /// Abort: discard the write set and release locks.
    pub fn abort(mut self) {
        self.finished = true;
        self.ops.clear();
        let env = Arc::clone(&self.env);
        env.abort_txn(self.id);
    }

    pub(crate) fn record(&mut self, op: Op) { self.ops.push(op); }

    /// Pending overlay for a table key: `Some(Some(v))` when this txn put
    /// `v`, `Some(None)` when it deleted the key, `None` when untouched.
    pub(crate) fn pending_table_get(&self, table: &str, key: &[u8]) -> Option<Option<&[u8]>> {
        for op in self.ops.iter().rev() {
            match op {
                Op::TablePut { table: t, key: k, value } if t == table && k == key => {
                    return Some(Some(value));
                }
                Op::TableDel { table: t, key: k } if t == table && k == key => {
                    return Some(None);
                }
                _ => {}
            }
        }
        None
    }

    pub(crate) fn pending_fifo_created(&self, file: &str) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, Op::FifoCreate { file: f, .. } if f == file))
    }

    pub(crate) fn pending_fifo_removed(&self, file: &str) -> bool {
        self.ops
            .iter()
            .any(|op| matches!(op, Op::FifoRemove { file: f } if f == file))
    }

    pub(crate) fn pending_appends(&self, file: &str) -> u32 {
        self.ops
            .iter()
            .filter(|op| matches!(op, Op::FifoAppend { file: f, .. } if f == file))
            .count() as u32
    }

    pub(crate) fn pending_consumes(&self, file: &str) -> u32 {
        self.ops
            .iter()
            .filter(|op| matches!(op, Op::FifoConsume { file: f, .. } if f == file))
            .count() as u32
    }

    /// Payload of a record this transaction appended but has not committed.
    pub(crate) fn pending_append_data(&self, file: &str, recno: u32) -> Option<Bytes> {
        self.ops.iter().find_map(|op| match op {
            Op::FifoAppend { file: f, recno: r, data } if f == file && *r == recno => {
                Some(data.clone())
            }
            _ => None,
        })
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.finished {
            self.env.abort_txn(self.id);
        }
    }
}

/// Hands out transaction ids and enforces the active-transaction cap.
pub(crate) struct TxnManager {
    next:       AtomicU64,
    active:     AtomicUsize,
    max_active: usize,
}

impl TxnManager {
    pub fn new(max_active: usize) -> Self {
        Self {
            next: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            max_active,
        }
    }

    pub fn begin(&self) -> Result<TxnId> {
        if self.active.fetch_add(1, Ordering::SeqCst) >= self.max_active {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return TooManyTransactionsSnafu {
                limit: self.max_active,
            }
            .fail();
        }
        Ok(self.next.fetch_add(1, Ordering::SeqCst))
    }

    pub fn finish(&self) { self.active.fetch_sub(1, Ordering::SeqCst); }
}
