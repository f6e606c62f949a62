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

//! Shared buffer pool.
//!
//! All page-structured files (tables and FIFO record files) are read and
//! written through the pool. Frames are `page_size` bytes, keyed by
//! (file id, page number). Reads are read-through; writes mark the frame
//! dirty and are written back on eviction, flush, or trickle.
//!
//! Eviction is least-recently-used among the lowest retention priority
//! first: a file opened with [`Priority::VeryHigh`] keeps its pages cached
//! until nothing else is left to evict.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    os::unix::fs::{FileExt, OpenOptionsExt},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, trace};

use crate::error::{NotFoundSnafu, Result};

/// Identifies an open file in the pool's registry.
pub(crate) type FileId = u32;

/// Buffer-pool retention priority of a file's pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Evicted in LRU order.
    #[default]
    Normal,
    /// Evicted only when no normal-priority page remains.
    VeryHigh,
}

/// A page address: file plus zero-based page number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PageId {
    pub file: FileId,
    pub page: u32,
}

struct Frame {
    data:      Box<[u8]>,
    dirty:     bool,
    last_used: u64,
}

struct PooledFile {
    file:     File,
    path:     PathBuf,
    priority: Priority,
}

struct PoolInner {
    files:        HashMap<FileId, PooledFile>,
    frames:       HashMap<PageId, Frame>,
    tick:         u64,
    next_file_id: FileId,
}

/// Fixed-capacity page cache shared by every container in the environment.
pub(crate) struct BufferPool {
    page_size: usize,
    capacity:  usize,
    inner:     Mutex<PoolInner>,
}

impl BufferPool {
    pub fn new(page_size: u32, cache_size: u64) -> Self {
        let page_size = page_size as usize;
        let capacity = usize::try_from(cache_size / page_size as u64)
            .unwrap_or(usize::MAX)
            .max(8);
        Self {
            page_size,
            capacity,
            inner: Mutex::new(PoolInner {
                files:        HashMap::new(),
                frames:       HashMap::new(),
                tick:         0,
                next_file_id: 1,
            }),
        }
    }

    pub const fn page_size(&self) -> usize { self.page_size }

    /// Open (or create, mode 0664) a file and register it with the pool.
    ///
    /// Opening a path that is already registered returns the existing id.
    /// A missing file without `create` is reported as NotFound.
    pub fn open_file(&self, path: &Path, create: bool, priority: Priority) -> Result<FileId> {
        let mut inner = self.inner.lock().unwrap();

        if let Some((id, _)) = inner.files.iter().find(|(_, f)| f.path == path) {
            return Ok(*id);
        }

        if !create && !path.exists() {
            return NotFoundSnafu.fail();
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .mode(0o664)
            .open(path)?;

        let id = inner.next_file_id;
        inner.next_file_id += 1;
        inner.files.insert(id, PooledFile {
            file,
            path: path.to_path_buf(),
            priority,
        });

        trace!(file = id, path = ?path, "pool file opened");
        Ok(id)
    }

    /// Write back the file's dirty frames, optionally fsync, and drop the
    /// file from the registry together with its frames.
    pub fn close_file(&self, id: FileId, sync: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        flush_frames_of(&mut inner, id, self.page_size)?;
        if sync && let Some(f) = inner.files.get(&id) {
            f.file.sync_all()?;
        }
        inner.frames.retain(|k, _| k.file != id);
        inner.files.remove(&id);
        Ok(())
    }

    /// Discard the file's frames without write-back, close it, and unlink
    /// it from the file system.
    pub fn remove_file(&self, id: FileId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.frames.retain(|k, _| k.file != id);
        if let Some(f) = inner.files.remove(&id) {
            fs::remove_file(&f.path)?;
            debug!(path = ?f.path, "pool file removed");
        }
        Ok(())
    }

    /// Shrink the file to `pages` pages, dropping any cached frames beyond.
    pub fn truncate_file(&self, id: FileId, pages: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .frames
            .retain(|k, _| k.file != id || k.page < pages);
        if let Some(f) = inner.files.get(&id) {
            f.file.set_len(u64::from(pages) * self.page_size as u64)?;
        }
        Ok(())
    }

    /// Grow the file to at least `pages` pages (extent preallocation).
    pub fn extend_file(&self, id: FileId, pages: u32) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        if let Some(f) = inner.files.get(&id) {
            let want = u64::from(pages) * self.page_size as u64;
            if f.file.metadata()?.len() < want {
                f.file.set_len(want)?;
            }
        }
        Ok(())
    }

    /// Run `f` over the page's bytes. The page is faulted in on demand;
    /// reading past end-of-file yields zeroes.
    pub fn with_page<R>(&self, id: PageId, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let mut inner = self.inner.lock().unwrap();
        let frame = self.frame_mut(&mut inner, id)?;
        Ok(f(&frame.data))
    }

    /// Run `f` over the page's bytes mutably and mark the frame dirty.
    pub fn with_page_mut<R>(&self, id: PageId, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut inner = self.inner.lock().unwrap();
        let frame = self.frame_mut(&mut inner, id)?;
        frame.dirty = true;
        Ok(f(&mut frame.data))
    }

    /// Write back every dirty frame of one file, optionally fsync.
    pub fn flush_file(&self, id: FileId, sync: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        flush_frames_of(&mut inner, id, self.page_size)?;
        if sync && let Some(f) = inner.files.get(&id) {
            f.file.sync_all()?;
        }
        Ok(())
    }

    /// Write back every dirty frame in the pool, optionally fsync each file.
    pub fn flush_all(&self, sync: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<FileId> = inner.files.keys().copied().collect();
        for id in ids {
            flush_frames_of(&mut inner, id, self.page_size)?;
            if sync && let Some(f) = inner.files.get(&id) {
                f.file.sync_all()?;
            }
        }
        Ok(())
    }

    /// Write dirty frames, oldest first, until at least `percent` percent of
    /// the cached frames are clean. Returns how many pages were written.
    pub fn trickle(&self, percent: u32) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();

        let total = inner.frames.len();
        if total == 0 {
            return Ok(0);
        }

        let mut dirty: Vec<(PageId, u64)> = inner
            .frames
            .iter()
            .filter(|(_, fr)| fr.dirty)
            .map(|(id, fr)| (*id, fr.last_used))
            .collect();
        dirty.sort_by_key(|(_, used)| *used);

        let mut written = 0usize;
        for (id, _) in dirty {
            let clean = total - count_dirty(&inner);
            if clean * 100 >= percent as usize * total {
                break;
            }
            write_back(&mut inner, id, self.page_size)?;
            written += 1;
        }

        Ok(written)
    }

    /// Number of dirty frames currently cached.
    #[cfg(test)]
    pub fn dirty_pages(&self) -> usize { count_dirty(&self.inner.lock().unwrap()) }

    fn frame_mut<'a>(&self, inner: &'a mut PoolInner, id: PageId) -> Result<&'a mut Frame> {
        if !inner.frames.contains_key(&id) {
            while inner.frames.len() >= self.capacity {
                if !evict_one(inner, self.page_size)? {
                    break;
                }
            }
            let data = self.read_page_from_disk(inner, id)?;
            inner.frames.insert(id, Frame {
                data,
                dirty: false,
                last_used: 0,
            });
        }

        inner.tick += 1;
        let tick = inner.tick;
        let frame = inner.frames.get_mut(&id).unwrap();
        frame.last_used = tick;
        Ok(frame)
    }

    fn read_page_from_disk(&self, inner: &PoolInner, id: PageId) -> Result<Box<[u8]>> {
        let mut buf = vec![0u8; self.page_size].into_boxed_slice();
        if let Some(f) = inner.files.get(&id.file) {
            let len = f.file.metadata()?.len();
            let offset = u64::from(id.page) * self.page_size as u64;
            if offset < len {
                let avail = usize::try_from((len - offset).min(self.page_size as u64)).unwrap();
                f.file.read_exact_at(&mut buf[..avail], offset)?;
            }
        }
        Ok(buf)
    }
}

fn count_dirty(inner: &PoolInner) -> usize { inner.frames.values().filter(|f| f.dirty).count() }

fn write_back(inner: &mut PoolInner, id: PageId, page_size: usize) -> Result<()> {
    let offset = u64::from(id.page) * page_size as u64;
    if let Some(frame) = inner.frames.get_mut(&id) {
        if frame.dirty {
            if let Some(f) = inner.files.get(&id.file) {
                f.file.write_all_at(&frame.data, offset)?;
            }
            frame.dirty = false;
        }
    }
    Ok(())
}

fn flush_frames_of(inner: &mut PoolInner, file: FileId, page_size: usize) -> Result<()> {
    let pages: Vec<PageId> = inner
        .frames
        .iter()
        .filter(|(k, fr)| k.file == file && fr.dirty)
        .map(|(k, _)| *k)
        .collect();
    for id in pages {
        write_back(inner, id, page_size)?;
    }
    Ok(())
}

/// Evict the least-recently-used frame of the lowest priority tier,
/// writing it back first when dirty. Returns false when nothing is
/// evictable.
fn evict_one(inner: &mut PoolInner, page_size: usize) -> Result<bool> {
    let mut victim: Option<(PageId, Priority, u64)> = None;
    for (id, frame) in &inner.frames {
        let prio = inner
            .files
            .get(&id.file)
            .map_or(Priority::Normal, |f| f.priority);
        let better = match victim {
            None => true,
            Some((_, vp, vt)) => (prio, frame.last_used) < (vp, vt),
        };
        if better {
            victim = Some((*id, prio, frame.last_used));
        }
    }

    let Some((id, _, _)) = victim else {
        return Ok(false);
    };
    write_back(inner, id, page_size)?;
    inner.frames.remove(&id);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use test_case::test_case;

    use super::*;

    fn pool_with_file(page_size: u32, cache_size: u64) -> (TempDir, BufferPool, FileId) {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::new(page_size, cache_size);
        let id = pool
            .open_file(&dir.path().join("data"), true, Priority::Normal)
            .unwrap();
        (dir, pool, id)
    }

    #[test]
    fn test_read_past_eof_is_zeroed() {
        let (_dir, pool, id) = pool_with_file(512, 512 * 64);
        let first = pool
            .with_page(PageId { file: id, page: 9 }, |p| p[0])
            .unwrap();
        assert_eq!(first, 0);
    }

    #[test]
    fn test_write_survives_eviction_and_flush() {
        let (_dir, pool, id) = pool_with_file(512, 512 * 64);

        pool.with_page_mut(PageId { file: id, page: 3 }, |p| p[7] = 0xAB)
            .unwrap();
        assert_eq!(pool.dirty_pages(), 1);

        pool.flush_all(true).unwrap();
        assert_eq!(pool.dirty_pages(), 0);

        let byte = pool
            .with_page(PageId { file: id, page: 3 }, |p| p[7])
            .unwrap();
        assert_eq!(byte, 0xAB);
    }

    #[test]
    fn test_eviction_prefers_normal_priority() {
        let dir = TempDir::new().unwrap();
        // Eight frames is the pool's floor capacity.
        let pool = BufferPool::new(512, 512 * 8);
        let hot = pool
            .open_file(&dir.path().join("hot"), true, Priority::VeryHigh)
            .unwrap();
        let cold = pool
            .open_file(&dir.path().join("cold"), true, Priority::Normal)
            .unwrap();

        for page in 0..4 {
            pool.with_page_mut(PageId { file: hot, page }, |p| p[0] = 1)
                .unwrap();
        }
        for page in 0..20 {
            pool.with_page_mut(PageId { file: cold, page }, |p| p[0] = 2)
                .unwrap();
        }

        // The very-high-priority pages must still be cached and intact.
        for page in 0..4 {
            let b = pool
                .with_page(PageId { file: hot, page }, |p| p[0])
                .unwrap();
            assert_eq!(b, 1);
        }
    }

    #[test_case(60, 4 ; "sixty percent clean target")]
    #[test_case(100, 0 ; "full clean target")]
    #[test_case(0, 10 ; "zero target writes nothing")]
    fn test_trickle_writes_until_target_clean(percent: u32, max_dirty_after: usize) {
        let (_dir, pool, id) = pool_with_file(512, 512 * 64);
        for page in 0..10 {
            pool.with_page_mut(PageId { file: id, page }, |p| p[0] = 1)
                .unwrap();
        }
        assert_eq!(pool.dirty_pages(), 10);

        pool.trickle(percent).unwrap();
        assert!(pool.dirty_pages() <= max_dirty_after);
    }

    #[test]
    fn test_remove_file_unlinks() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::new(512, 512 * 64);
        let path = dir.path().join("gone");
        let id = pool.open_file(&path, true, Priority::Normal).unwrap();
        pool.with_page_mut(PageId { file: id, page: 0 }, |p| p[0] = 1)
            .unwrap();
        pool.remove_file(id).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let pool = BufferPool::new(512, 512 * 64);
        let err = pool
            .open_file(&dir.path().join("absent"), false, Priority::Normal)
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
