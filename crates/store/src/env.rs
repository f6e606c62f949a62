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

//! The environment: process-wide handle to the storage substrate.
//!
//! An [`Env`] owns the buffer pool, the write-ahead log, the lock manager,
//! the transaction manager, and the registry of open containers. Opening an
//! environment always runs recovery: every committed transaction still in
//! the log is re-applied (idempotently) before the first caller proceeds.
//!
//! Containers are addressed by name. The registry (name → open container,
//! behind a read/write lock) is the only in-memory mapping from names to
//! handles; nothing transient is ever persisted.
//!
//! ## Commit protocol
//!
//! 1. append the transaction's write set to the log as one record (fsync
//!    unless `txn_nosync`)
//! 2. apply the ops to the shared state (pool pages, resident tables,
//!    registry)
//! 3. release the transaction's locks
//!
//! Checkpoint excludes commits (a write lock over the append+apply window),
//! flushes resident tables and all dirty pages, then lets the log prune its
//! old segments.

use std::{
    collections::HashMap,
    fs,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{debug, error, info};

use crate::{
    error::{InvalidOptionsSnafu, NotFoundSnafu, PanickedSnafu, Result},
    fifo::{FifoFile, FifoHandle, FifoParams},
    lock::{LockCaps, LockManager, LockMode, Resource, TxnId},
    pool::{BufferPool, Priority},
    table::{Table, TableHandle},
    txn::{Op, Txn, TxnManager},
    wal::Wal,
};

/// Environment configuration.
#[derive(Clone, Debug)]
pub struct EnvOptions {
    /// Home directory; created with mode 0750 when absent.
    pub home:             PathBuf,
    /// Buffer-pool size in bytes.
    pub cache_size:       u64,
    /// Page size for every container file.
    pub page_size:        u32,
    /// In-memory log buffer size.
    pub log_buffer_size:  usize,
    /// Log segment roll size.
    pub log_segment_size: u64,
    /// Commit without fsyncing the log (group-commit relaxation).
    pub txn_nosync:       bool,
    /// Lock-manager caps.
    pub max_lockers:      usize,
    pub max_locks:        usize,
    pub max_lock_objects: usize,
    /// Active-transaction cap.
    pub max_active_txns:  usize,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            home:             PathBuf::from("./data"),
            cache_size:       64 * 1024 * 1024,
            page_size:        4096,
            log_buffer_size:  32 * 1024,
            log_segment_size: 10 * 1024 * 1024,
            txn_nosync:       false,
            max_lockers:      20_000,
            max_locks:        20_000,
            max_lock_objects: 20_000,
            max_active_txns:  20_000,
        }
    }
}

impl EnvOptions {
    fn validate(&self) -> Result<()> {
        if self.page_size < 512 {
            return InvalidOptionsSnafu {
                reason: format!("page size {} is below the 512-byte minimum", self.page_size),
            }
            .fail();
        }
        if self.cache_size < u64::from(self.page_size) * 8 {
            return InvalidOptionsSnafu {
                reason: "cache size holds fewer than eight pages".to_string(),
            }
            .fail();
        }
        Ok(())
    }
}

/// Diagnostic events reported through the environment's event hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvEvent {
    /// The environment hit an unrecoverable inconsistency; it refuses
    /// further work and recovery must be run by a restart.
    Panic,
    /// A write to stable storage failed.
    WriteFailed,
}

type EventHook = Box<dyn Fn(EnvEvent) + Send + Sync>;

pub(crate) enum Container {
    Table(Arc<Table>),
    Fifo(Arc<FifoFile>),
}

pub(crate) struct EnvInner {
    pub opts:        EnvOptions,
    pub pool:        BufferPool,
    pub wal:         Wal,
    pub locks:       LockManager,
    pub txns:        TxnManager,
    pub containers:  RwLock<HashMap<String, Container>>,
    /// Read side taken by every commit, write side by checkpoint, so a
    /// checkpoint never interleaves with a half-applied commit.
    pub commit_lock: RwLock<()>,
    pub panicked:    AtomicBool,
    pub event_hook:  Mutex<Option<EventHook>>,
}

/// Process-wide handle to the storage substrate. Cheap to clone.
#[derive(Clone)]
pub struct Env {
    inner: Arc<EnvInner>,
}

impl Env {
    /// Open the environment, creating the home directory when needed and
    /// unconditionally running recovery.
    pub fn open(opts: EnvOptions) -> Result<Self> {
        opts.validate()?;

        if !opts.home.exists() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o750)
                .create(&opts.home)?;
            info!(home = ?opts.home, "created environment home");
        }

        let pool = BufferPool::new(opts.page_size, opts.cache_size);
        let (wal, recovered) = Wal::open(
            &opts.home,
            opts.log_segment_size,
            opts.log_buffer_size,
            opts.txn_nosync,
        )?;

        let inner = Arc::new(EnvInner {
            locks: LockManager::new(LockCaps {
                max_lockers: opts.max_lockers,
                max_locks:   opts.max_locks,
                max_objects: opts.max_lock_objects,
            }),
            txns: TxnManager::new(opts.max_active_txns),
            containers: RwLock::new(HashMap::new()),
            commit_lock: RwLock::new(()),
            panicked: AtomicBool::new(false),
            event_hook: Mutex::new(None),
            pool,
            wal,
            opts,
        });

        let replayed = recovered.len();
        for txn in recovered {
            for op in &txn.ops {
                inner.apply_op(op)?;
            }
        }
        info!(transactions = replayed, "environment recovery complete");

        Ok(Self { inner })
    }

    /// Begin a transaction.
    pub fn begin(&self) -> Result<Txn> {
        self.inner.ensure_usable()?;
        let id = self.inner.txns.begin()?;
        Ok(Txn {
            env:      Arc::clone(&self.inner),
            id,
            ops:      Vec::new(),
            finished: false,
        })
    }

    /// Open (creating on demand) an ordered table with the given
    /// buffer-pool retention priority.
    pub fn table_open(&self, name: &str, priority: Priority) -> Result<TableHandle> {
        self.inner.ensure_usable()?;
        let table = self.inner.table_open_internal(name, priority)?;
        Ok(TableHandle {
            env: Arc::clone(&self.inner),
            table,
        })
    }

    /// Open a FIFO file under the caller's transaction.
    ///
    /// Idempotent for an existing file. With `create`, a missing file is
    /// recorded in the transaction's write set and materializes at commit;
    /// without it, a missing file is NotFound.
    pub fn fifo_open(
        &self,
        txn: &mut Txn,
        name: &str,
        params: FifoParams,
        create: bool,
    ) -> Result<FifoHandle> {
        self.inner.ensure_usable()?;
        let slot = 4 + u64::from(params.record_length);
        if slot > u64::from(self.inner.opts.page_size) {
            return InvalidOptionsSnafu {
                reason: format!(
                    "record length {} plus header does not fit a {}-byte page",
                    params.record_length, self.inner.opts.page_size
                ),
            }
            .fail();
        }

        self.inner
            .locks
            .acquire(txn.id, &Resource::File(name.to_string()), LockMode::Exclusive)?;

        let open = self.inner.fifo_get(name).is_some() || txn.pending_fifo_created(name);
        if !open {
            if self.inner.path_for(name).exists() {
                self.inner.fifo_open_internal(name, params, false)?;
            } else if create {
                txn.record(Op::FifoCreate {
                    file:          name.to_string(),
                    record_length: params.record_length,
                    extent_size:   params.extent_size,
                });
            } else {
                return NotFoundSnafu.fail();
            }
        }

        Ok(FifoHandle {
            env: Arc::clone(&self.inner),
            name: name.to_string(),
            params,
        })
    }

    /// Transactionally remove a FIFO file: the unlink and registry drop
    /// happen at commit, so an abort leaves the file untouched.
    pub fn fifo_remove(&self, txn: &mut Txn, name: &str) -> Result<()> {
        self.inner.ensure_usable()?;
        self.inner
            .locks
            .acquire(txn.id, &Resource::File(name.to_string()), LockMode::Exclusive)?;

        let known = self.inner.fifo_get(name).is_some()
            || txn.pending_fifo_created(name)
            || self.inner.path_for(name).exists();
        if !known {
            return NotFoundSnafu.fail();
        }

        txn.record(Op::FifoRemove {
            file: name.to_string(),
        });
        Ok(())
    }

    /// Flush and release one open FIFO file; the on-disk file stays.
    pub fn fifo_close(&self, name: &str) -> Result<()> {
        let container = self.inner.containers.write().unwrap().remove(name);
        if let Some(Container::Fifo(fifo)) = container {
            self.inner.pool.close_file(fifo.file, true)?;
        }
        Ok(())
    }

    /// Flush and release one open table.
    pub fn table_close(&self, name: &str) -> Result<()> {
        let container = self.inner.containers.write().unwrap().remove(name);
        if let Some(Container::Table(table)) = container {
            table.flush(&self.inner.pool)?;
            self.inner.pool.close_file(table.file, true)?;
        }
        Ok(())
    }

    /// Write a checkpoint: force every dirty page to disk and prune the
    /// log. Commits are excluded for the duration.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.ensure_usable()?;
        let _guard = self.inner.commit_lock.write().unwrap();

        {
            let containers = self.inner.containers.read().unwrap();
            for container in containers.values() {
                if let Container::Table(table) = container {
                    table.flush(&self.inner.pool)?;
                }
            }
        }

        if let Err(e) = self.inner.pool.flush_all(true) {
            self.inner.emit(EnvEvent::WriteFailed);
            return Err(e);
        }
        self.inner.wal.checkpoint()?;
        debug!("txn checkpoint complete");
        Ok(())
    }

    /// Write dirty pages until at least `percent` percent of the buffer
    /// pool is clean. Returns the number of pages written.
    pub fn trickle(&self, percent: u32) -> Result<usize> {
        self.inner.ensure_usable()?;
        self.inner.pool.trickle(percent)
    }

    /// Run one deadlock-detection pass; returns the number of victims.
    pub fn detect_deadlocks(&self) -> usize { self.inner.locks.detect() }

    /// Register the diagnostic event hook.
    pub fn set_event_hook(&self, hook: impl Fn(EnvEvent) + Send + Sync + 'static) {
        *self.inner.event_hook.lock().unwrap() = Some(Box::new(hook));
    }

    #[must_use]
    pub fn home(&self) -> &Path { &self.inner.opts.home }

    #[must_use]
    pub fn options(&self) -> &EnvOptions { &self.inner.opts }

    /// Flush everything and close. Containers should be closed first; any
    /// still open are flushed here.
    pub fn close(&self) -> Result<()> {
        {
            let containers = self.inner.containers.read().unwrap();
            for container in containers.values() {
                if let Container::Table(table) = container {
                    table.flush(&self.inner.pool)?;
                }
            }
        }
        self.inner.pool.flush_all(true)?;
        info!("environment closed");
        Ok(())
    }
}

impl EnvInner {
    fn ensure_usable(&self) -> Result<()> {
        if self.panicked.load(Ordering::SeqCst) {
            return PanickedSnafu.fail();
        }
        Ok(())
    }

    pub(crate) fn emit(&self, event: EnvEvent) {
        if event == EnvEvent::Panic {
            self.panicked.store(true, Ordering::SeqCst);
        }
        if let Some(hook) = &*self.event_hook.lock().unwrap() {
            hook(event);
        }
    }

    pub(crate) fn path_for(&self, name: &str) -> PathBuf { self.opts.home.join(name) }

    pub(crate) fn fifo_get(&self, name: &str) -> Option<Arc<FifoFile>> {
        match self.containers.read().unwrap().get(name) {
            Some(Container::Fifo(fifo)) => Some(Arc::clone(fifo)),
            _ => None,
        }
    }

    fn table_open_internal(&self, name: &str, priority: Priority) -> Result<Arc<Table>> {
        if let Some(Container::Table(table)) = self.containers.read().unwrap().get(name) {
            return Ok(Arc::clone(table));
        }

        let mut containers = self.containers.write().unwrap();
        if let Some(Container::Table(table)) = containers.get(name) {
            return Ok(Arc::clone(table));
        }

        let file = self.pool.open_file(&self.path_for(name), true, priority)?;
        let table = Arc::new(Table::load(&self.pool, file, name)?);
        containers.insert(name.to_string(), Container::Table(Arc::clone(&table)));
        debug!(table = name, "table opened");
        Ok(table)
    }

    fn fifo_open_internal(
        &self,
        name: &str,
        params: FifoParams,
        create: bool,
    ) -> Result<Arc<FifoFile>> {
        if let Some(fifo) = self.fifo_get(name) {
            return Ok(fifo);
        }

        let mut containers = self.containers.write().unwrap();
        if let Some(Container::Fifo(fifo)) = containers.get(name) {
            return Ok(Arc::clone(fifo));
        }

        let fifo = FifoFile::open(&self.pool, &self.path_for(name), name, params, create)?;
        containers.insert(name.to_string(), Container::Fifo(Arc::clone(&fifo)));
        debug!(queue = name, "record file opened");
        Ok(fifo)
    }

    /// Commit: log, apply, release. Called by [`Txn::commit`].
    pub(crate) fn commit_txn(&self, id: TxnId, ops: Vec<Op>) -> Result<()> {
        let result = self.log_and_apply(id, &ops);
        self.locks.release_all(id);
        self.txns.finish();
        result
    }

    fn log_and_apply(&self, id: TxnId, ops: &[Op]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.ensure_usable()?;

        let _guard = self.commit_lock.read().unwrap();

        if let Err(e) = self.wal.append_commit(id, ops) {
            self.emit(EnvEvent::WriteFailed);
            return Err(e);
        }

        for op in ops {
            if let Err(e) = self.apply_op(op) {
                // The log already holds the commit record; the resident
                // state is now suspect and only restart recovery can
                // reconcile it.
                error!(txn = id, error = %e, "apply failed after commit record");
                self.emit(EnvEvent::Panic);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Abort: discard the write set, release locks.
    pub(crate) fn abort_txn(&self, id: TxnId) {
        self.locks.release_all(id);
        self.txns.finish();
    }

    /// Apply one committed operation to the shared state. Every arm is
    /// idempotent so recovery can replay records that were already
    /// reflected in flushed pages.
    pub(crate) fn apply_op(&self, op: &Op) -> Result<()> {
        match op {
            Op::TablePut { table, key, value } => {
                let t = self.table_open_internal(table, Priority::VeryHigh)?;
                t.apply_put(key, value);
            }
            Op::TableDel { table, key } => {
                let t = self.table_open_internal(table, Priority::VeryHigh)?;
                t.apply_del(key);
            }
            Op::FifoCreate {
                file,
                record_length,
                extent_size,
            } => {
                self.fifo_open_internal(
                    file,
                    FifoParams {
                        record_length: *record_length,
                        extent_size:   *extent_size,
                    },
                    true,
                )?;
            }
            // A missing file here can only mean replay of a record whose
            // file a later logged remove already unlinked; the op is moot.
            Op::FifoAppend { file, recno, data } => {
                match self.fifo_open_internal(file, FifoParams::default(), false) {
                    Ok(fifo) => fifo.apply_append(&self.pool, *recno, data)?,
                    Err(e) if e.is_not_found() => {
                        debug!(queue = file, "skipping append for removed file");
                    }
                    Err(e) => return Err(e),
                }
            }
            Op::FifoConsume { file, recno } => {
                match self.fifo_open_internal(file, FifoParams::default(), false) {
                    Ok(fifo) => fifo.apply_consume(&self.pool, *recno)?,
                    Err(e) if e.is_not_found() => {
                        debug!(queue = file, "skipping consume for removed file");
                    }
                    Err(e) => return Err(e),
                }
            }
            Op::FifoRemove { file } => {
                let removed = self.containers.write().unwrap().remove(file);
                if let Some(Container::Fifo(fifo)) = removed {
                    self.pool.remove_file(fifo.file)?;
                } else {
                    // Not resident (replay): unlink directly if present.
                    let path = self.path_for(file);
                    if path.exists() {
                        fs::remove_file(path)?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn test_options(dir: &TempDir) -> EnvOptions {
        EnvOptions {
            home: dir.path().join("data"),
            cache_size: 4096 * 64,
            page_size: 4096,
            ..Default::default()
        }
    }

    fn small_fifo() -> FifoParams {
        FifoParams {
            record_length: 64,
            extent_size:   0,
        }
    }

    #[test]
    fn test_open_creates_home() {
        let dir = TempDir::new().unwrap();
        let opts = test_options(&dir);
        let env = Env::open(opts.clone()).unwrap();
        assert!(opts.home.is_dir());
        drop(env);
    }

    #[test]
    fn test_commit_append_then_consume() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(test_options(&dir)).unwrap();

        let mut txn = env.begin().unwrap();
        let q = env.fifo_open(&mut txn, "jobs", small_fifo(), true).unwrap();
        let recno = q.append(&mut txn, b"payload").unwrap();
        assert_eq!(recno, 1);
        txn.commit().unwrap();

        let mut txn = env.begin().unwrap();
        let q = env.fifo_open(&mut txn, "jobs", small_fifo(), false).unwrap();
        let got = q.consume(&mut txn).unwrap();
        assert_eq!(got.unwrap().as_ref(), b"payload");
        assert!(q.consume(&mut txn).unwrap().is_none());
        txn.commit().unwrap();
    }

    #[test]
    fn test_abort_discards_everything() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(test_options(&dir)).unwrap();

        let mut txn = env.begin().unwrap();
        let q = env.fifo_open(&mut txn, "jobs", small_fifo(), true).unwrap();
        q.append(&mut txn, b"ghost").unwrap();
        txn.abort();

        // Nothing materialized: not in the registry, not on disk.
        let mut txn = env.begin().unwrap();
        let err = env
            .fifo_open(&mut txn, "jobs", small_fifo(), false)
            .unwrap_err();
        assert!(err.is_not_found());
        txn.abort();
        assert!(!env.home().join("jobs").exists());
    }

    #[test]
    fn test_drop_aborts_transaction() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(test_options(&dir)).unwrap();

        {
            let mut txn = env.begin().unwrap();
            let q = env.fifo_open(&mut txn, "jobs", small_fifo(), true).unwrap();
            q.append(&mut txn, b"ghost").unwrap();
            // txn dropped here without commit
        }

        let mut txn = env.begin().unwrap();
        assert!(
            env.fifo_open(&mut txn, "jobs", small_fifo(), false)
                .unwrap_err()
                .is_not_found()
        );
        txn.abort();
    }

    #[test]
    fn test_read_your_own_append() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(test_options(&dir)).unwrap();

        let mut txn = env.begin().unwrap();
        let q = env.fifo_open(&mut txn, "jobs", small_fifo(), true).unwrap();
        q.append(&mut txn, b"mine").unwrap();
        let got = q.consume(&mut txn).unwrap();
        assert_eq!(got.unwrap().as_ref(), b"mine");
        txn.commit().unwrap();
    }

    #[test]
    fn test_record_too_long_rejected() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(test_options(&dir)).unwrap();

        let mut txn = env.begin().unwrap();
        let q = env.fifo_open(&mut txn, "jobs", small_fifo(), true).unwrap();
        let err = q.append(&mut txn, &[0u8; 65]).unwrap_err();
        assert!(matches!(err, crate::Error::RecordTooLong { .. }));
        txn.abort();
    }

    #[test]
    fn test_table_transactional_roundtrip() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(test_options(&dir)).unwrap();
        let table = env.table_open("queue.list", Priority::VeryHigh).unwrap();

        let mut txn = env.begin().unwrap();
        table.insert(&mut txn, b"a", &0i64.to_le_bytes()).unwrap();
        txn.commit().unwrap();

        let mut txn = env.begin().unwrap();
        assert!(table.get(&mut txn, b"a").unwrap().is_some());
        assert!(table.get(&mut txn, b"missing").unwrap().is_none());
        assert!(matches!(
            table.insert(&mut txn, b"a", b"dup").unwrap_err(),
            crate::Error::KeyExists { .. }
        ));
        txn.abort();
    }

    #[test]
    fn test_panicked_env_rejects_work() {
        let dir = TempDir::new().unwrap();
        let env = Env::open(test_options(&dir)).unwrap();
        env.inner.emit(EnvEvent::Panic);
        assert!(matches!(
            env.begin().unwrap_err(),
            crate::Error::Panicked { .. }
        ));
    }
}
