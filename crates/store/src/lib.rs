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

//! Embedded transactional storage substrate.
//!
//! The substrate provides, behind one process-wide [`Env`]:
//! - a shared buffer pool with retention priorities and trickle flushing
//! - a segmented write-ahead log (redo-only, one record per committed
//!   transaction)
//! - transactions with strict two-phase locking and deadlock detection
//! - two record-container kinds: ordered key/value [tables](TableHandle)
//!   and fixed-record [FIFO files](FifoHandle) supporting atomic append and
//!   destructive consume by record number
//!
//! Mutations are buffered in the transaction's write set and applied to the
//! shared state only after the commit record is on disk, so abort never has
//! anything to undo and recovery is a pure redo scan.
//!
//! ## Usage
//!
//! ```ignore
//! let env = Env::open(EnvOptions::default())?;
//! let mut txn = env.begin()?;
//! let queue = env.fifo_open(&mut txn, "jobs", FifoParams::default(), true)?;
//! queue.append(&mut txn, b"payload")?;
//! txn.commit()?;
//! ```

mod env;
mod error;
mod fifo;
mod lock;
mod pool;
mod table;
mod txn;
mod wal;

pub use env::{Env, EnvEvent, EnvOptions};
pub use error::{Error, Result};
pub use fifo::{FifoHandle, FifoParams};
pub use lock::TxnId;
pub use pool::Priority;
pub use table::TableHandle;
pub use txn::Txn;
