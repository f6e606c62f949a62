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

//! Lock manager: strict two-phase locking with deadlock detection.
//!
//! Locks come in two modes (shared/exclusive) on two resource kinds: whole
//! containers and single table entries. A transaction keeps every lock it
//! acquires until commit or abort. Conflicting requests block on a condvar
//! with no timeout — the deadlock detector is the liveness backstop.
//!
//! [`LockManager::detect`] builds the waits-for graph and, for each cycle it
//! finds, marks the **youngest** participant (largest transaction id) as a
//! victim. The victim's blocked `acquire` wakes up and returns
//! [`Error::Deadlock`](crate::Error), one victim per cycle per call.

use std::{
    collections::{HashMap, HashSet},
    sync::{Condvar, Mutex},
};

use tracing::debug;

use crate::error::{DeadlockSnafu, LockTableFullSnafu, Result};

/// Transaction identifier; ids increase in begin order, so the largest id
/// in a cycle is the youngest transaction.
pub type TxnId = u64;

/// A lockable resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    /// A whole container (table or FIFO file), by name.
    File(String),
    /// One entry of a table.
    Entry { file: String, key: Vec<u8> },
}

/// Lock mode. Shared is compatible with shared; exclusive with nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

const fn conflicts(a: LockMode, b: LockMode) -> bool {
    matches!(a, LockMode::Exclusive) || matches!(b, LockMode::Exclusive)
}

#[derive(Default)]
struct LockState {
    holders: HashMap<TxnId, LockMode>,
    waiters: Vec<(TxnId, LockMode)>,
}

impl LockState {
    /// A request is grantable when no *other* transaction holds a
    /// conflicting mode. A sole holder may upgrade shared to exclusive.
    fn grantable(&self, txn: TxnId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self
                .holders
                .iter()
                .all(|(t, m)| *t == txn || *m == LockMode::Shared),
            LockMode::Exclusive => self.holders.keys().all(|t| *t == txn),
        }
    }
}

/// Caps mirroring the environment's lock-manager limits.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LockCaps {
    pub max_lockers: usize,
    pub max_locks:   usize,
    pub max_objects: usize,
}

struct LockTable {
    objects: HashMap<Resource, LockState>,
    /// Transactions marked by the detector; their blocked acquire fails.
    victims: HashSet<TxnId>,
    /// Locks held per transaction (also the set of active lockers).
    per_txn: HashMap<TxnId, usize>,
    total:   usize,
}

pub(crate) struct LockManager {
    inner: Mutex<LockTable>,
    cond:  Condvar,
    caps:  LockCaps,
}

impl LockManager {
    pub fn new(caps: LockCaps) -> Self {
        Self {
            inner: Mutex::new(LockTable {
                objects: HashMap::new(),
                victims: HashSet::new(),
                per_txn: HashMap::new(),
                total:   0,
            }),
            cond: Condvar::new(),
            caps,
        }
    }

    /// Acquire `mode` on `resource` for `txn`, blocking until compatible.
    ///
    /// # Errors
    ///
    /// `Deadlock` when the detector chose this transaction as a victim
    /// while it was blocked; `LockTableFull` when a cap is exceeded.
    pub fn acquire(&self, txn: TxnId, resource: &Resource, mode: LockMode) -> Result<()> {
        let mut table = self.inner.lock().unwrap();

        loop {
            let grantable = table
                .objects
                .get(resource)
                .is_none_or(|s| s.grantable(txn, mode));

            if grantable {
                return self.grant(&mut table, txn, resource, mode);
            }

            let state = table.objects.get_mut(resource).unwrap();
            if !state.waiters.iter().any(|(t, _)| *t == txn) {
                state.waiters.push((txn, mode));
            }

            table = self.cond.wait(table).unwrap();

            if table.victims.remove(&txn) {
                if let Some(s) = table.objects.get_mut(resource) {
                    s.waiters.retain(|(t, _)| *t != txn);
                    if s.holders.is_empty() && s.waiters.is_empty() {
                        table.objects.remove(resource);
                    }
                }
                self.cond.notify_all();
                return DeadlockSnafu.fail();
            }
        }
    }

    fn grant(
        &self,
        table: &mut LockTable,
        txn: TxnId,
        resource: &Resource,
        mode: LockMode,
    ) -> Result<()> {
        if !table.objects.contains_key(resource) && table.objects.len() >= self.caps.max_objects {
            return LockTableFullSnafu {
                reason: format!("object limit {} reached", self.caps.max_objects),
            }
            .fail();
        }

        let already_holds = table
            .objects
            .get(resource)
            .is_some_and(|s| s.holders.contains_key(&txn));
        if !already_holds {
            if table.total >= self.caps.max_locks {
                return LockTableFullSnafu {
                    reason: format!("lock limit {} reached", self.caps.max_locks),
                }
                .fail();
            }
            if !table.per_txn.contains_key(&txn) && table.per_txn.len() >= self.caps.max_lockers {
                return LockTableFullSnafu {
                    reason: format!("locker limit {} reached", self.caps.max_lockers),
                }
                .fail();
            }
        }

        let state = table.objects.entry(resource.clone()).or_default();
        let merged = match (state.holders.get(&txn), mode) {
            (Some(LockMode::Exclusive), _) | (_, LockMode::Exclusive) => LockMode::Exclusive,
            _ => LockMode::Shared,
        };
        let prev = state.holders.insert(txn, merged);
        state.waiters.retain(|(t, _)| *t != txn);

        if prev.is_none() {
            *table.per_txn.entry(txn).or_insert(0) += 1;
            table.total += 1;
        }
        Ok(())
    }

    /// Release every lock and wait registration of `txn` and wake waiters.
    pub fn release_all(&self, txn: TxnId) {
        let mut table = self.inner.lock().unwrap();

        table.objects.retain(|_, state| {
            state.holders.remove(&txn);
            state.waiters.retain(|(t, _)| *t != txn);
            !(state.holders.is_empty() && state.waiters.is_empty())
        });

        if let Some(held) = table.per_txn.remove(&txn) {
            table.total -= held;
        }
        table.victims.remove(&txn);

        drop(table);
        self.cond.notify_all();
    }

    /// Examine the waits-for graph; abort the youngest member of each
    /// cycle. Returns the number of victims chosen by this call.
    pub fn detect(&self) -> usize {
        let mut table = self.inner.lock().unwrap();
        let mut chosen = 0usize;

        loop {
            let edges = build_edges(&table);
            let Some(cycle) = find_cycle(&edges) else {
                break;
            };
            let victim = *cycle.iter().max().unwrap();
            debug!(victim, cycle = ?cycle, "deadlock cycle, aborting youngest");
            table.victims.insert(victim);
            chosen += 1;
        }

        drop(table);
        if chosen > 0 {
            self.cond.notify_all();
        }
        chosen
    }
}

/// Waiter → holder edges for every conflicting pair, skipping transactions
/// already marked as victims.
fn build_edges(table: &LockTable) -> HashMap<TxnId, Vec<TxnId>> {
    let mut edges: HashMap<TxnId, Vec<TxnId>> = HashMap::new();
    for state in table.objects.values() {
        for (w, wmode) in &state.waiters {
            if table.victims.contains(w) {
                continue;
            }
            for (h, hmode) in &state.holders {
                if h != w && conflicts(*wmode, *hmode) {
                    edges.entry(*w).or_default().push(*h);
                }
            }
        }
    }
    edges
}

/// Depth-first search for one cycle; returns the transactions on it.
fn find_cycle(edges: &HashMap<TxnId, Vec<TxnId>>) -> Option<Vec<TxnId>> {
    const IN_PATH: u8 = 1;
    const DONE: u8 = 2;

    let mut state: HashMap<TxnId, u8> = HashMap::new();

    for &start in edges.keys() {
        if state.contains_key(&start) {
            continue;
        }
        let mut stack: Vec<(TxnId, usize)> = vec![(start, 0)];
        let mut path: Vec<TxnId> = vec![start];
        state.insert(start, IN_PATH);

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let i = top.1;
            top.1 += 1;

            match edges.get(&node).and_then(|v| v.get(i)).copied() {
                Some(child) => match state.get(&child) {
                    Some(&IN_PATH) => {
                        let pos = path.iter().position(|&t| t == child).unwrap();
                        return Some(path[pos..].to_vec());
                    }
                    Some(_) => {}
                    None => {
                        state.insert(child, IN_PATH);
                        stack.push((child, 0));
                        path.push(child);
                    }
                },
                None => {
                    state.insert(node, DONE);
                    stack.pop();
                    path.pop();
                }
            }
        }
    }
    None
}
