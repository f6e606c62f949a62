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

//! The queue catalog.
//!
//! A single ordered table named `queue.list` maps queue name → persistent
//! metadata. The only persistent field is the approximate queue `length`
//! (a little-endian i64, maintained only when a size cap is configured);
//! open file handles live in the substrate's registry, never on disk.
//!
//! Opening the catalog at startup runs the reopen protocol: every cataloged
//! queue file is reopened so that the registry agrees with the catalog
//! before the first operation is served. Transient open failures (deadlock,
//! not-found) are retried with bounded exponential backoff.

use std::{thread, time::Duration};

use queued_store::{Env, FifoParams, Priority, TableHandle, Txn};
use tracing::{info, warn};

use crate::error::{CatalogCorruptedSnafu, Result, StartupRetriesExhaustedSnafu};

/// Name of the catalog table and its file inside the environment home.
pub(crate) const CATALOG_NAME: &str = "queue.list";

/// Retry budget for the startup open loops.
const STARTUP_RETRY_ATTEMPTS: u32 = 5;
const STARTUP_RETRY_BASE: Duration = Duration::from_millis(100);
const STARTUP_RETRY_CAP: Duration = Duration::from_secs(3);

pub(crate) struct Catalog {
    table: TableHandle,
}

impl Catalog {
    /// Open the catalog and run the reopen protocol: iterate all entries
    /// and reopen each queue file so the registry is fully populated.
    pub fn open(env: &Env, params: FifoParams) -> Result<Self> {
        let table = retry_with_backoff(CATALOG_NAME, || {
            env.table_open(CATALOG_NAME, Priority::VeryHigh)
        })?;
        let catalog = Self { table };

        let mut txn = env.begin()?;
        let names: Vec<String> = catalog
            .snapshot(&mut txn)?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        for name in &names {
            retry_with_backoff(name, || {
                env.fifo_open(&mut txn, name, params, true).map(|_| ())
            })?;
        }
        txn.commit()?;

        info!(queues = names.len(), "catalog opened, queue files reopened");
        Ok(catalog)
    }

    /// Look up a queue's length; `Ok(None)` when the queue is unknown.
    pub fn lookup(&self, txn: &mut Txn, name: &str) -> Result<Option<i64>> {
        let value = self.table.get(txn, name.as_bytes())?;
        value.map(|v| decode_length(name, &v)).transpose()
    }

    /// Like [`lookup`](Self::lookup) but takes the entry write lock up
    /// front, for operations that will update the length before commit.
    pub fn lookup_for_update(&self, txn: &mut Txn, name: &str) -> Result<Option<i64>> {
        let value = self.table.get_for_update(txn, name.as_bytes())?;
        value.map(|v| decode_length(name, &v)).transpose()
    }

    /// Register a new queue with length 0.
    pub fn insert(&self, txn: &mut Txn, name: &str) -> Result<()> {
        self.table
            .insert(txn, name.as_bytes(), &0i64.to_le_bytes())?;
        Ok(())
    }

    /// Drop a queue's catalog entry.
    pub fn remove(&self, txn: &mut Txn, name: &str) -> Result<()> {
        self.table.delete(txn, name.as_bytes())?;
        Ok(())
    }

    /// Read-modify-write of the length counter. The caller serializes
    /// concurrent adjusters (the engine's length mutex).
    pub fn adjust_length(&self, txn: &mut Txn, name: &str, delta: i64) -> Result<()> {
        let current = self
            .lookup_for_update(txn, name)?
            .ok_or_else(|| {
                CatalogCorruptedSnafu {
                    reason: format!("length adjust on uncataloged queue {name}"),
                }
                .build()
            })?;
        self.table
            .put(txn, name.as_bytes(), &(current + delta).to_le_bytes())?;
        Ok(())
    }

    /// Visit every queue in catalog-key order under the caller's
    /// transaction; the visitor returns false to stop early.
    pub fn for_each(
        &self,
        txn: &mut Txn,
        visit: &mut dyn FnMut(&str, i64) -> bool,
    ) -> Result<()> {
        for (name, length) in self.snapshot(txn)? {
            if !visit(&name, length) {
                break;
            }
        }
        Ok(())
    }

    /// Materialize the catalog under the transaction's read locks.
    fn snapshot(&self, txn: &mut Txn) -> Result<Vec<(String, i64)>> {
        let mut raw: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        self.table.for_each(txn, &mut |k, v| {
            raw.push((k.to_vec(), v.to_vec()));
            Ok(true)
        })?;

        let mut entries = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            let name = String::from_utf8_lossy(&key).into_owned();
            let length = decode_length(&name, &value)?;
            entries.push((name, length));
        }
        Ok(entries)
    }
}

fn decode_length(name: &str, value: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        CatalogCorruptedSnafu {
            reason: format!(
                "queue {name}: catalog value is {} bytes, expected 8",
                value.len()
            ),
        }
        .build()
    })?;
    Ok(i64::from_le_bytes(bytes))
}

/// Retry transient (deadlock / not-found) startup failures with bounded
/// exponential backoff; anything else propagates immediately.
fn retry_with_backoff<T>(
    what: &str,
    mut attempt: impl FnMut() -> queued_store::Result<T>,
) -> Result<T> {
    let mut delay = STARTUP_RETRY_BASE;
    for remaining in (0..STARTUP_RETRY_ATTEMPTS).rev() {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_deadlock() || e.is_not_found() => {
                if remaining == 0 {
                    break;
                }
                warn!(what, error = %e, retry_in = ?delay, "transient failure opening catalog object");
                thread::sleep(delay);
                delay = (delay * 2).min(STARTUP_RETRY_CAP);
            }
            Err(e) => return Err(e.into()),
        }
    }
    StartupRetriesExhaustedSnafu {
        what: what.to_string(),
    }
    .fail()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_length() {
        assert_eq!(decode_length("q", &42i64.to_le_bytes()).unwrap(), 42);
        assert!(decode_length("q", b"short").is_err());
    }

    #[test]
    fn test_retry_gives_up_after_budget() {
        let mut calls = 0;
        let result: Result<()> = retry_with_backoff("q", || {
            calls += 1;
            Err(std::io::Error::other("nope").into())
        });
        // Non-transient errors are not retried.
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
