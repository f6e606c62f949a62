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

use std::{sync::Arc, thread, time::Duration};

use queued_store::{Env, EnvOptions, FifoParams, Priority};
use tempfile::TempDir;

fn options(dir: &TempDir) -> EnvOptions {
    EnvOptions {
        home: dir.path().join("data"),
        ..Default::default()
    }
}

fn params() -> FifoParams {
    FifoParams {
        record_length: 128,
        extent_size:   0,
    }
}

fn put(env: &Env, queue: &str, data: &[u8]) {
    let mut txn = env.begin().unwrap();
    let fifo = env.fifo_open(&mut txn, queue, params(), true).unwrap();
    fifo.append(&mut txn, data).unwrap();
    txn.commit().unwrap();
}

fn take(env: &Env, queue: &str) -> Option<Vec<u8>> {
    let mut txn = env.begin().unwrap();
    let fifo = match env.fifo_open(&mut txn, queue, params(), false) {
        Ok(fifo) => fifo,
        Err(e) if e.is_not_found() => return None,
        Err(e) => panic!("open failed: {e}"),
    };
    let got = fifo.consume(&mut txn).unwrap().map(|b| b.to_vec());
    txn.commit().unwrap();
    got
}

#[test]
fn test_committed_records_survive_unclean_shutdown() {
    let dir = TempDir::new().unwrap();

    {
        let env = Env::open(options(&dir)).unwrap();
        put(&env, "jobs", b"one");
        put(&env, "jobs", b"two");
        // No checkpoint, no close: all data lives in the log only.
        drop(env);
    }

    let env = Env::open(options(&dir)).unwrap();
    assert_eq!(take(&env, "jobs").unwrap(), b"one");
    assert_eq!(take(&env, "jobs").unwrap(), b"two");
    assert!(take(&env, "jobs").is_none());
}

#[test]
fn test_consumes_replay_exactly_once() {
    let dir = TempDir::new().unwrap();

    {
        let env = Env::open(options(&dir)).unwrap();
        for payload in [b"a".as_slice(), b"b", b"c"] {
            put(&env, "jobs", payload);
        }
        assert_eq!(take(&env, "jobs").unwrap(), b"a");
        drop(env);
    }

    let env = Env::open(options(&dir)).unwrap();
    assert_eq!(take(&env, "jobs").unwrap(), b"b");
    assert_eq!(take(&env, "jobs").unwrap(), b"c");
    assert!(take(&env, "jobs").is_none());
}

#[test]
fn test_checkpoint_then_restart_without_log() {
    let dir = TempDir::new().unwrap();

    {
        let env = Env::open(options(&dir)).unwrap();
        put(&env, "jobs", b"stable");
        env.checkpoint().unwrap();
        drop(env);
    }

    // The checkpoint pruned the old segments; data now comes from pages.
    let env = Env::open(options(&dir)).unwrap();
    assert_eq!(take(&env, "jobs").unwrap(), b"stable");
}

#[test]
fn test_mixed_table_and_fifo_recovery() {
    let dir = TempDir::new().unwrap();

    {
        let env = Env::open(options(&dir)).unwrap();
        let table = env.table_open("queue.list", Priority::VeryHigh).unwrap();

        let mut txn = env.begin().unwrap();
        let fifo = env.fifo_open(&mut txn, "jobs", params(), true).unwrap();
        fifo.append(&mut txn, b"payload").unwrap();
        table.insert(&mut txn, b"jobs", &1i64.to_le_bytes()).unwrap();
        txn.commit().unwrap();
        drop(env);
    }

    let env = Env::open(options(&dir)).unwrap();
    let table = env.table_open("queue.list", Priority::VeryHigh).unwrap();

    let mut txn = env.begin().unwrap();
    let value = table.get(&mut txn, b"jobs").unwrap().unwrap();
    assert_eq!(value.as_ref(), 1i64.to_le_bytes());
    txn.commit().unwrap();

    assert_eq!(take(&env, "jobs").unwrap(), b"payload");
}

#[test]
fn test_transactional_remove_rolls_back_on_abort() {
    let dir = TempDir::new().unwrap();
    let env = Env::open(options(&dir)).unwrap();

    put(&env, "jobs", b"keep me");
    let path = dir.path().join("data").join("jobs");
    env.checkpoint().unwrap();
    assert!(path.exists());

    {
        let mut txn = env.begin().unwrap();
        env.fifo_remove(&mut txn, "jobs").unwrap();
        txn.abort();
    }

    // Abort rolled the unlink back; the record is still consumable.
    assert!(path.exists());
    assert_eq!(take(&env, "jobs").unwrap(), b"keep me");
}

#[test]
fn test_commit_removes_file_durably() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("data").join("jobs");

    {
        let env = Env::open(options(&dir)).unwrap();
        put(&env, "jobs", b"doomed");
        env.checkpoint().unwrap();
        assert!(path.exists());

        let mut txn = env.begin().unwrap();
        env.fifo_remove(&mut txn, "jobs").unwrap();
        txn.commit().unwrap();
        assert!(!path.exists());
        drop(env);
    }

    let env = Env::open(options(&dir)).unwrap();
    assert!(!path.exists());
    assert!(take(&env, "jobs").is_none());
}

#[test]
fn test_atomicity_across_catalog_and_queue_file() {
    let dir = TempDir::new().unwrap();
    let env = Env::open(options(&dir)).unwrap();
    let table = env.table_open("queue.list", Priority::VeryHigh).unwrap();

    // A transaction that created a queue, wrote a record, and registered
    // it, then aborted: none of the three effects may remain.
    {
        let mut txn = env.begin().unwrap();
        let fifo = env.fifo_open(&mut txn, "jobs", params(), true).unwrap();
        fifo.append(&mut txn, b"ghost").unwrap();
        table.insert(&mut txn, b"jobs", &1i64.to_le_bytes()).unwrap();
        txn.abort();
    }

    let mut txn = env.begin().unwrap();
    assert!(table.get(&mut txn, b"jobs").unwrap().is_none());
    txn.commit().unwrap();
    assert!(take(&env, "jobs").is_none());
    assert!(!dir.path().join("data").join("jobs").exists());
}

#[test]
fn test_concurrent_appends_serialize_on_the_file_lock() {
    let dir = TempDir::new().unwrap();
    let env = Arc::new(Env::open(options(&dir)).unwrap());

    put(&env, "jobs", b"seed");

    let mut handles = Vec::new();
    for t in 0..4 {
        let env = Arc::clone(&env);
        handles.push(thread::spawn(move || {
            for i in 0..100 {
                let payload = format!("{t}-{i}");
                put(&env, "jobs", payload.as_bytes());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut count = 0;
    while take(&env, "jobs").is_some() {
        count += 1;
    }
    assert_eq!(count, 401);
}

#[test]
fn test_deadlock_detector_breaks_crossed_transactions() {
    let dir = TempDir::new().unwrap();
    let env = Arc::new(Env::open(options(&dir)).unwrap());

    put(&env, "a", b"1");
    put(&env, "b", b"1");

    // txn1 consumes from a then b; txn2 consumes from b then a.
    let env1 = Arc::clone(&env);
    let h1 = thread::spawn(move || {
        let mut txn = env1.begin().unwrap();
        let qa = env1.fifo_open(&mut txn, "a", params(), false)?;
        qa.consume(&mut txn)?;
        thread::sleep(Duration::from_millis(100));
        let qb = env1.fifo_open(&mut txn, "b", params(), false)?;
        qb.consume(&mut txn)?;
        txn.commit()
    });
    let env2 = Arc::clone(&env);
    let h2 = thread::spawn(move || {
        let mut txn = env2.begin().unwrap();
        let qb = env2.fifo_open(&mut txn, "b", params(), false)?;
        qb.consume(&mut txn)?;
        thread::sleep(Duration::from_millis(100));
        let qa = env2.fifo_open(&mut txn, "a", params(), false)?;
        qa.consume(&mut txn)?;
        txn.commit()
    });

    // Let both sides block, then run the detector until it breaks the
    // cycle.
    let mut victims = 0;
    for _ in 0..100 {
        thread::sleep(Duration::from_millis(10));
        victims += env.detect_deadlocks();
        if victims > 0 {
            break;
        }
    }

    let r1 = h1.join().unwrap();
    let r2 = h2.join().unwrap();
    let deadlocked =
        usize::from(r1.as_ref().is_err_and(|e| e.is_deadlock()))
            + usize::from(r2.as_ref().is_err_and(|e| e.is_deadlock()));
    assert_eq!(victims, 1);
    assert_eq!(deadlocked, 1, "exactly one side must lose");
}
