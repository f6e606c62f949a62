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

//! The queue engine.
//!
//! Every public operation is one ACID transaction over the catalog plus at
//! most one queue file:
//!
//! - [`put`](QueueEngine::put): look up the queue (creating it and its
//!   catalog entry on first use), enforce the size cap, append one record,
//!   bump the length counter when a cap is configured.
//! - [`get`](QueueEngine::get): consume the oldest record; absent queue and
//!   empty queue are both `Ok(None)`.
//! - [`delete_queue`](QueueEngine::delete_queue): transactional file remove
//!   plus catalog delete; the open handle is dropped only when the commit
//!   succeeds, so an abort leaves a consistent process.
//! - [`stats`](QueueEngine::stats): the `STAT <name> <length>` listing in
//!   catalog-key order, terminated by `END`.
//!
//! A deadlock victim aborts and surfaces as a retryable failure — the
//! engine never retries on the caller's behalf.

use std::sync::Mutex;

use bytes::Bytes;
use queued_store::{Env, EnvEvent};
use tracing::{debug, error, info, warn};

use crate::{
    catalog::{CATALOG_NAME, Catalog},
    error::{InvalidQueueNameSnafu, QueueFullSnafu, Result, UnknownQueueSnafu},
    settings::Settings,
    workers::WorkerSet,
};

/// Queue names are catalog keys and file names at once.
const MAX_QUEUE_NAME: usize = 511;

/// The engine: environment, catalog, and maintenance workers.
pub struct QueueEngine {
    env:         Env,
    catalog:     Catalog,
    settings:    Settings,
    /// Serializes the read-modify-write of the length counter. Taken only
    /// when a cap is configured; without one, lengths are not maintained.
    length_lock: Mutex<()>,
    workers:     Option<WorkerSet>,
}

impl QueueEngine {
    /// Open the engine: environment (recovery runs), catalog reopen
    /// protocol, then the maintenance workers whose intervals are nonzero.
    pub fn open(settings: Settings) -> Result<Self> {
        settings.validate()?;

        let env = Env::open(settings.env_options())?;
        env.set_event_hook(log_env_event);

        let catalog = Catalog::open(&env, settings.fifo_params())?;
        let workers = WorkerSet::start(env.clone(), &settings)?;

        info!(home = ?settings.env_home, "queue engine started");
        Ok(Self {
            env,
            catalog,
            settings,
            length_lock: Mutex::new(()),
            workers: Some(workers),
        })
    }

    /// Enqueue one record. Creates the queue on first use. Fails with
    /// [`QueueFull`](crate::Error::QueueFull) when a cap is configured and
    /// reached.
    pub fn put(&self, name: &str, payload: &[u8]) -> Result<()> {
        validate_queue_name(name)?;
        let cap = self.settings.max_queue_size;

        let mut txn = self.env.begin()?;

        let length = if cap > 0 {
            self.catalog.lookup_for_update(&mut txn, name)?
        } else {
            self.catalog.lookup(&mut txn, name)?
        };

        let fifo = self
            .env
            .fifo_open(&mut txn, name, self.settings.fifo_params(), true)?;
        if length.is_none() {
            self.catalog.insert(&mut txn, name)?;
            debug!(queue = name, "queue created");
        }

        if cap > 0 && length.unwrap_or(0) + 1 > i64::from(cap) {
            txn.abort();
            warn!(queue = name, limit = cap, "queue size limited");
            return QueueFullSnafu {
                name:  name.to_string(),
                limit: cap,
            }
            .fail();
        }

        fifo.append(&mut txn, payload)?;

        if cap > 0 {
            let _serial = self.length_lock.lock().unwrap();
            self.catalog.adjust_length(&mut txn, name, 1)?;
        }

        txn.commit()?;
        Ok(())
    }

    /// Dequeue the oldest record. `Ok(None)` when the queue is unknown or
    /// empty.
    pub fn get(&self, name: &str) -> Result<Option<Bytes>> {
        validate_queue_name(name)?;
        let cap = self.settings.max_queue_size;

        let mut txn = self.env.begin()?;

        let length = if cap > 0 {
            self.catalog.lookup_for_update(&mut txn, name)?
        } else {
            self.catalog.lookup(&mut txn, name)?
        };
        if length.is_none() {
            txn.abort();
            return Ok(None);
        }

        let fifo = match self
            .env
            .fifo_open(&mut txn, name, self.settings.fifo_params(), false)
        {
            Ok(fifo) => fifo,
            Err(e) if e.is_not_found() => {
                // Cataloged but not openable: routed around like a closed
                // handle; the next restart reconciles catalog and files.
                warn!(queue = name, "cataloged queue has no openable file");
                txn.abort();
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(payload) = fifo.consume(&mut txn)? else {
            txn.abort();
            return Ok(None);
        };

        if cap > 0 {
            let _serial = self.length_lock.lock().unwrap();
            self.catalog.adjust_length(&mut txn, name, -1)?;
        }

        txn.commit()?;
        Ok(Some(payload))
    }

    /// Delete a queue: transactional unlink of the queue file plus catalog
    /// removal, in one transaction.
    pub fn delete_queue(&self, name: &str) -> Result<()> {
        validate_queue_name(name)?;

        let mut txn = self.env.begin()?;

        if self.catalog.lookup(&mut txn, name)?.is_none() {
            txn.abort();
            return UnknownQueueSnafu {
                name: name.to_string(),
            }
            .fail();
        }

        self.env.fifo_remove(&mut txn, name)?;
        self.catalog.remove(&mut txn, name)?;
        txn.commit()?;

        info!(queue = name, "queue deleted");
        Ok(())
    }

    /// Produce the `STAT <name> <length>\r\n … END` listing.
    ///
    /// Lines are emitted in catalog-key order under one transaction;
    /// emission stops early when the remaining capacity cannot hold the
    /// next line, and `END` is always appended once the transaction
    /// commits.
    pub fn stats(&self, buf_cap: usize) -> Result<String> {
        let mut out = String::new();
        let mut remains = buf_cap.saturating_sub(5);

        let mut txn = self.env.begin()?;
        self.catalog.for_each(&mut txn, &mut |name, length| {
            if remains > name.len() + 8 {
                let line = format!("STAT {name} {length}\r\n");
                remains = remains.saturating_sub(line.len());
                out.push_str(&line);
                true
            } else {
                false
            }
        })?;
        txn.commit()?;

        out.push_str("END");
        Ok(out)
    }

    /// Shut down: stop the workers, take a final checkpoint, close every
    /// queue file in catalog-iteration order, the catalog, and the
    /// environment.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut workers) = self.workers.take() {
            workers.shutdown();
        }

        if let Err(e) = self.env.checkpoint() {
            error!(error = %e, "final checkpoint failed");
        }

        let names = {
            let mut txn = self.env.begin()?;
            let mut names = Vec::new();
            self.catalog.for_each(&mut txn, &mut |name, _| {
                names.push(name.to_string());
                true
            })?;
            txn.commit()?;
            names
        };
        for name in names {
            match self.env.fifo_close(&name) {
                Ok(()) => debug!(queue = %name, "queue file closed"),
                Err(e) => error!(queue = %name, error = %e, "queue file close failed"),
            }
        }

        self.env.table_close(CATALOG_NAME)?;
        info!("queue.list closed");

        self.env.close()?;
        info!("queue engine stopped");
        Ok(())
    }

    /// The engine's effective settings.
    #[must_use]
    pub const fn settings(&self) -> &Settings { &self.settings }
}

impl Drop for QueueEngine {
    fn drop(&mut self) {
        // Disconnects the shutdown channel; workers exit on their next
        // tick. Durable state needs no cleanup here: commits are logged.
        self.workers.take();
    }
}

/// Substrate diagnostic events, logged in the engine's prefix. Nothing
/// flows to protocol clients.
fn log_env_event(event: EnvEvent) {
    let stamp = chrono::Local::now().format("%c").to_string();
    match event {
        EnvEvent::Panic => {
            error!(timestamp = %stamp, "event: panic, recovery should be run");
        }
        EnvEvent::WriteFailed => {
            error!(timestamp = %stamp, "event: write to stable storage failed");
        }
    }
}

/// A queue name doubles as an on-disk file name, so beyond the protocol
/// limits (length, no NUL) it must not collide with the environment's own
/// files or escape the home directory.
fn validate_queue_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("empty name".to_string())
    } else if name.len() > MAX_QUEUE_NAME {
        Some(format!("{} bytes exceeds the {MAX_QUEUE_NAME}-byte limit", name.len()))
    } else if name.contains(['\0', '/']) {
        Some("contains NUL or path separator".to_string())
    } else if name == "." || name == ".." {
        Some("reserved path component".to_string())
    } else if name == CATALOG_NAME || name.starts_with("log.") {
        Some("collides with an environment file".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => InvalidQueueNameSnafu { reason }.fail(),
        None => Ok(()),
    }
}
