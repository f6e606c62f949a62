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

//! Maintenance workers.
//!
//! Three long-running threads, each owning a clone of the environment:
//!
//! - **checkpointer** — `txn_checkpoint` every `chkpoint_val` seconds
//! - **trickle** — flush dirty pages to the `memp_trickle_percent` target
//!   every `memp_trickle_val` seconds
//! - **deadlock detector** — one detection pass every `dldetect_val`
//!   microseconds, aborting the youngest member of each cycle
//!
//! A worker whose interval is zero is not started. Worker errors are
//! logged, never fatal. All three tick on `recv_timeout` against a shared
//! shutdown channel, so dropping the [`WorkerSet`] (or calling
//! [`WorkerSet::shutdown`]) stops every worker.

use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use queued_store::Env;
use snafu::ResultExt;
use tracing::{debug, error, info};

use crate::{
    error::{Result, WorkerSpawnSnafu},
    settings::Settings,
};

pub(crate) struct WorkerSet {
    shutdown: Option<Sender<()>>,
    handles:  Vec<JoinHandle<()>>,
}

impl WorkerSet {
    /// Start every worker whose interval is configured nonzero.
    pub fn start(env: Env, settings: &Settings) -> Result<Self> {
        let (tx, rx) = crossbeam::channel::bounded::<()>(0);
        let mut handles = Vec::new();

        if settings.chkpoint_val > 0 {
            let interval = Duration::from_secs(settings.chkpoint_val);
            handles.push(spawn_worker("checkpoint", {
                let env = env.clone();
                let rx = rx.clone();
                move || run_checkpointer(&env, interval, &rx)
            })?);
        }

        if settings.memp_trickle_val > 0 {
            let interval = Duration::from_secs(settings.memp_trickle_val);
            let percent = settings.memp_trickle_percent;
            handles.push(spawn_worker("memp_trickle", {
                let env = env.clone();
                let rx = rx.clone();
                move || run_trickle(&env, interval, percent, &rx)
            })?);
        }

        if settings.dldetect_val > 0 {
            let interval = Duration::from_micros(settings.dldetect_val);
            handles.push(spawn_worker("deadlock_detect", {
                let rx = rx.clone();
                move || run_deadlock_detector(&env, interval, &rx)
            })?);
        }

        Ok(Self {
            shutdown: Some(tx),
            handles,
        })
    }

    /// Disconnect the shutdown channel and join every worker.
    pub fn shutdown(&mut self) {
        self.shutdown.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("maintenance worker panicked during shutdown");
            }
        }
    }
}

fn spawn_worker(
    name: &str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("queued-{name}"))
        .spawn(body)
        .context(WorkerSpawnSnafu {
            name: name.to_string(),
        })
}

/// Tick until the shutdown channel disconnects; `recv_timeout` doubles as
/// the interval sleep.
fn ticks(rx: &Receiver<()>, interval: Duration) -> bool {
    matches!(rx.recv_timeout(interval), Err(RecvTimeoutError::Timeout))
}

fn run_checkpointer(env: &Env, interval: Duration, rx: &Receiver<()>) {
    info!(period = ?interval, "checkpoint thread started");
    while ticks(rx, interval) {
        match env.checkpoint() {
            Ok(()) => debug!("checkpoint thread: a txn_checkpoint is done"),
            Err(e) => error!(error = %e, "checkpoint thread"),
        }
    }
    info!("checkpoint thread stopped");
}

fn run_trickle(env: &Env, interval: Duration, percent: u32, rx: &Receiver<()>) {
    info!(period = ?interval, percent, "memp_trickle thread started");
    while ticks(rx, interval) {
        match env.trickle(percent) {
            Ok(pages) => debug!(pages, "memp_trickle thread: wrote dirty pages"),
            Err(e) => error!(error = %e, "memp_trickle thread"),
        }
    }
    info!("memp_trickle thread stopped");
}

fn run_deadlock_detector(env: &Env, interval: Duration, rx: &Receiver<()>) {
    info!(period = ?interval, "deadlock detecting thread started");
    while ticks(rx, interval) {
        let victims = env.detect_deadlocks();
        if victims > 0 {
            debug!(victims, "deadlock detecting thread: aborted victims");
        }
    }
    info!("deadlock detecting thread stopped");
}
