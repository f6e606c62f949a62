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

use std::{collections::HashSet, sync::Arc, thread};

use queued_engine::{Error, QueueEngine, Settings};
use tempfile::TempDir;

fn test_settings(dir: &TempDir) -> Settings {
    Settings {
        env_home: dir.path().join("data"),
        re_len: 256,
        q_extentsize: 0,
        // Keep the periodic workers quiet during tests; the deadlock
        // detector stays on since concurrent tests rely on it.
        chkpoint_val: 0,
        memp_trickle_val: 0,
        dldetect_val: 20_000,
        ..Default::default()
    }
}

fn open(dir: &TempDir) -> QueueEngine {
    queued_telemetry::init_default_ut_logging();
    QueueEngine::open(test_settings(dir)).unwrap()
}

/// Deadlock victims surface as retryable failures and the policy is that
/// the caller retries; concurrent tests do exactly that.
fn put_retrying(engine: &QueueEngine, name: &str, payload: &[u8]) {
    loop {
        match engine.put(name, payload) {
            Ok(()) => return,
            Err(e) if e.is_retryable() => continue,
            Err(e) => panic!("put failed: {e}"),
        }
    }
}

#[test]
fn test_basic_fifo_order() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    engine.put("q", b"A").unwrap();
    engine.put("q", b"B").unwrap();
    engine.put("q", b"C").unwrap();

    assert_eq!(engine.get("q").unwrap().unwrap().as_ref(), b"A");
    assert_eq!(engine.get("q").unwrap().unwrap().as_ref(), b"B");
    assert_eq!(engine.get("q").unwrap().unwrap().as_ref(), b"C");
    assert!(engine.get("q").unwrap().is_none());

    engine.close().unwrap();
}

#[test]
fn test_get_from_unknown_queue_is_none() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    assert!(engine.get("nope").unwrap().is_none());
    engine.close().unwrap();
}

#[test]
fn test_cap_enforcement() {
    let dir = TempDir::new().unwrap();
    queued_telemetry::init_default_ut_logging();
    let engine = QueueEngine::open(Settings {
        max_queue_size: 2,
        ..test_settings(&dir)
    })
    .unwrap();

    engine.put("q", b"A").unwrap();
    engine.put("q", b"B").unwrap();
    let err = engine.put("q", b"C").unwrap_err();
    assert!(matches!(err, Error::QueueFull { .. }));

    // The failed put left no record and no counter bump behind.
    assert_eq!(engine.get("q").unwrap().unwrap().as_ref(), b"A");
    engine.put("q", b"C").unwrap();

    assert_eq!(engine.get("q").unwrap().unwrap().as_ref(), b"B");
    assert_eq!(engine.get("q").unwrap().unwrap().as_ref(), b"C");
    assert!(engine.get("q").unwrap().is_none());

    engine.close().unwrap();
}

#[test]
fn test_restart_preserves_committed_records() {
    let dir = TempDir::new().unwrap();

    {
        let engine = open(&dir);
        engine.put("q", b"X").unwrap();
        // Dropped without close: pages unflushed, like a crash. The commit
        // is in the log.
        drop(engine);
    }

    let engine = open(&dir);
    assert_eq!(engine.get("q").unwrap().unwrap().as_ref(), b"X");
    assert!(engine.get("q").unwrap().is_none());
    engine.close().unwrap();
}

#[test]
fn test_restart_after_clean_close() {
    let dir = TempDir::new().unwrap();

    {
        let engine = open(&dir);
        engine.put("q", b"first").unwrap();
        engine.put("q", b"second").unwrap();
        engine.close().unwrap();
    }

    let engine = open(&dir);
    assert_eq!(engine.get("q").unwrap().unwrap().as_ref(), b"first");
    assert_eq!(engine.get("q").unwrap().unwrap().as_ref(), b"second");
    assert!(engine.get("q").unwrap().is_none());
    engine.close().unwrap();
}

#[test]
fn test_consumed_records_stay_consumed_across_restart() {
    let dir = TempDir::new().unwrap();

    {
        let engine = open(&dir);
        engine.put("q", b"A").unwrap();
        engine.put("q", b"B").unwrap();
        assert_eq!(engine.get("q").unwrap().unwrap().as_ref(), b"A");
        drop(engine);
    }

    // At-most-once: "A" must not come back.
    let engine = open(&dir);
    assert_eq!(engine.get("q").unwrap().unwrap().as_ref(), b"B");
    assert!(engine.get("q").unwrap().is_none());
    engine.close().unwrap();
}

#[test]
fn test_delete_queue() {
    let dir = TempDir::new().unwrap();

    {
        let engine = open(&dir);
        engine.put("q", b"A").unwrap();
        engine.delete_queue("q").unwrap();
        assert!(engine.get("q").unwrap().is_none());
        assert!(
            !dir.path().join("data").join("q").exists(),
            "queue file must be unlinked"
        );
        drop(engine);
    }

    let engine = open(&dir);
    assert!(engine.get("q").unwrap().is_none());
    assert!(!dir.path().join("data").join("q").exists());
    engine.close().unwrap();
}

#[test]
fn test_delete_unknown_queue_fails() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let err = engine.delete_queue("ghost").unwrap_err();
    assert!(matches!(err, Error::UnknownQueue { .. }));
    engine.close().unwrap();
}

#[test]
fn test_stats_listing_format_and_order() {
    let dir = TempDir::new().unwrap();
    queued_telemetry::init_default_ut_logging();
    // Lengths are only maintained with a cap configured.
    let engine = QueueEngine::open(Settings {
        max_queue_size: 100,
        ..test_settings(&dir)
    })
    .unwrap();

    engine.put("a", b"1").unwrap();
    engine.put("b", b"1").unwrap();
    engine.put("b", b"2").unwrap();
    engine.put("c", b"1").unwrap();
    engine.put("c", b"2").unwrap();
    engine.put("c", b"3").unwrap();

    let listing = engine.stats(128).unwrap();
    assert_eq!(listing, "STAT a 1\r\nSTAT b 2\r\nSTAT c 3\r\nEND");

    engine.close().unwrap();
}

#[test]
fn test_stats_truncates_but_always_ends() {
    let dir = TempDir::new().unwrap();
    queued_telemetry::init_default_ut_logging();
    let engine = QueueEngine::open(Settings {
        max_queue_size: 100,
        ..test_settings(&dir)
    })
    .unwrap();

    engine.put("first-queue", b"1").unwrap();
    engine.put("second-queue", b"1").unwrap();

    // Room for roughly one line only.
    let listing = engine.stats(30).unwrap();
    assert!(listing.ends_with("END"));
    assert!(listing.contains("STAT first-queue 1\r\n"));
    assert!(!listing.contains("second-queue"));

    // And an empty catalog still produces the terminator.
    let empty_dir = TempDir::new().unwrap();
    let empty = open(&empty_dir);
    assert_eq!(empty.stats(128).unwrap(), "END");
    empty.close().unwrap();

    engine.close().unwrap();
}

#[test]
fn test_stats_lengths_track_gets() {
    let dir = TempDir::new().unwrap();
    queued_telemetry::init_default_ut_logging();
    let engine = QueueEngine::open(Settings {
        max_queue_size: 100,
        ..test_settings(&dir)
    })
    .unwrap();

    for _ in 0..5 {
        engine.put("q", b"x").unwrap();
    }
    for _ in 0..2 {
        engine.get("q").unwrap().unwrap();
    }
    assert_eq!(engine.stats(128).unwrap(), "STAT q 3\r\nEND");

    engine.close().unwrap();
}

#[test]
fn test_stats_survive_restart() {
    let dir = TempDir::new().unwrap();
    queued_telemetry::init_default_ut_logging();
    let settings = Settings {
        max_queue_size: 100,
        ..test_settings(&dir)
    };

    {
        let engine = QueueEngine::open(settings.clone()).unwrap();
        engine.put("a", b"1").unwrap();
        engine.put("b", b"1").unwrap();
        engine.put("b", b"2").unwrap();
        drop(engine);
    }

    let engine = QueueEngine::open(settings).unwrap();
    assert_eq!(engine.stats(128).unwrap(), "STAT a 1\r\nSTAT b 2\r\nEND");
    engine.close().unwrap();
}

#[test]
fn test_record_longer_than_re_len_is_server_error() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    let payload = vec![0u8; 257];
    assert!(engine.put("q", &payload).is_err());
    // Nothing was enqueued.
    assert!(engine.get("q").unwrap().is_none());
    engine.close().unwrap();
}

#[test]
fn test_invalid_queue_names_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);
    for name in ["", "a/b", ".", "..", "queue.list", "log.0000000007"] {
        assert!(
            matches!(engine.put(name, b"x"), Err(Error::InvalidQueueName { .. })),
            "name {name:?} must be rejected"
        );
    }
    engine.close().unwrap();
}

#[test]
fn test_concurrent_producers_single_consumer() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 1000;

    let dir = TempDir::new().unwrap();
    queued_telemetry::init_default_ut_logging();
    // Group commit keeps 8000 commits fast; durability is not under test.
    let engine = Arc::new(
        QueueEngine::open(Settings {
            txn_nosync: true,
            ..test_settings(&dir)
        })
        .unwrap(),
    );

    // Seed the queue so the create race is off the hot path.
    put_retrying(&engine, "q", b"seed");

    let mut handles = Vec::new();
    for t in 0..PRODUCERS {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                let payload = format!("{t:02}-{i:04}");
                put_retrying(&engine, "q", payload.as_bytes());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let mut seen = HashSet::new();
    let mut per_producer_last: Vec<i64> = vec![-1; PRODUCERS];
    while let Some(payload) = engine.get("q").unwrap() {
        if payload.as_ref() == b"seed" {
            continue;
        }
        let text = std::str::from_utf8(&payload).unwrap().to_string();
        let (producer, index) = text.split_once('-').unwrap();
        let producer: usize = producer.parse().unwrap();
        let index: i64 = index.parse().unwrap();

        // Within one producer the order is preserved.
        assert!(index > per_producer_last[producer], "reordered {text}");
        per_producer_last[producer] = index;

        assert!(seen.insert(text), "duplicate payload");
    }
    assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);

    Arc::try_unwrap(engine)
        .map_err(|_| ())
        .unwrap()
        .close()
        .unwrap();
}

#[test]
fn test_independent_queues_do_not_interfere() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir);

    engine.put("red", b"r1").unwrap();
    engine.put("blue", b"b1").unwrap();
    engine.put("red", b"r2").unwrap();

    assert_eq!(engine.get("blue").unwrap().unwrap().as_ref(), b"b1");
    assert_eq!(engine.get("red").unwrap().unwrap().as_ref(), b"r1");
    assert!(engine.get("blue").unwrap().is_none());
    assert_eq!(engine.get("red").unwrap().unwrap().as_ref(), b"r2");

    engine.close().unwrap();
}

#[test]
fn test_restart_reopens_all_queues() {
    let dir = TempDir::new().unwrap();
    queued_telemetry::init_default_ut_logging();
    let settings = Settings {
        max_queue_size: 100,
        ..test_settings(&dir)
    };

    {
        let engine = QueueEngine::open(settings.clone()).unwrap();
        for (queue, count) in [("alpha", 1), ("beta", 2), ("gamma", 3)] {
            for _ in 0..count {
                engine.put(queue, b"x").unwrap();
            }
        }
        engine.close().unwrap();
    }

    let engine = QueueEngine::open(settings).unwrap();
    assert_eq!(
        engine.stats(256).unwrap(),
        "STAT alpha 1\r\nSTAT beta 2\r\nSTAT gamma 3\r\nEND"
    );
    // And all of them are still consumable.
    for (queue, count) in [("alpha", 1), ("beta", 2), ("gamma", 3)] {
        for _ in 0..count {
            assert!(engine.get(queue).unwrap().is_some());
        }
        assert!(engine.get(queue).unwrap().is_none());
    }
    engine.close().unwrap();
}
