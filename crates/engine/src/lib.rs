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

//! Persistent transactional queue engine.
//!
//! Named FIFO queues over the [`queued_store`] substrate: enqueue appends a
//! fixed-width record, dequeue destructively consumes the oldest one, and
//! all queue state survives restart. A catalog table (`queue.list`) is the
//! source of truth for which queues exist and — when a size cap is
//! configured — their depth.
//!
//! The front-end (wire protocol, connection handling) is an external
//! collaborator: it calls [`QueueEngine::put`], [`QueueEngine::get`],
//! [`QueueEngine::delete_queue`] and [`QueueEngine::stats`].
//!
//! ## Usage
//!
//! ```ignore
//! let engine = QueueEngine::open(Settings::default())?;
//! engine.put("jobs", b"payload")?;
//! let payload = engine.get("jobs")?;       // Some(b"payload")
//! let listing = engine.stats(4096)?;       // "STAT jobs 0\r\nEND"
//! engine.close()?;
//! ```

mod catalog;
mod engine;
mod error;
mod settings;
mod workers;

pub use engine::QueueEngine;
pub use error::{Error, Result};
pub use settings::Settings;
