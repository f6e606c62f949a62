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

use snafu::{Location, Snafu};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the queue engine.
///
/// The front-end maps these onto its wire protocol: a retryable failure
/// ([`Error::is_retryable`]) becomes a protocol-level error line the client
/// may retry, [`Error::QueueFull`] becomes a server error, and absent
/// queues never error at all — `get` returns `Ok(None)`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(transparent)]
    Store {
        source: queued_store::Error,
        #[snafu(implicit)]
        loc:    Location,
    },

    #[snafu(display("queue {name} is full (limit {limit})"))]
    QueueFull {
        name:  String,
        limit: u32,
        #[snafu(implicit)]
        loc:   Location,
    },

    #[snafu(display("unknown queue {name}"))]
    UnknownQueue {
        name: String,
        #[snafu(implicit)]
        loc:  Location,
    },

    #[snafu(display("invalid queue name: {reason}"))]
    InvalidQueueName {
        reason: String,
        #[snafu(implicit)]
        loc:    Location,
    },

    #[snafu(display("invalid settings: {reason}"))]
    InvalidSettings {
        reason: String,
        #[snafu(implicit)]
        loc:    Location,
    },

    #[snafu(display("catalog is corrupted: {reason}"))]
    CatalogCorrupted {
        reason: String,
        #[snafu(implicit)]
        loc:    Location,
    },

    #[snafu(display("startup retry budget exhausted opening {what}"))]
    StartupRetriesExhausted {
        what: String,
        #[snafu(implicit)]
        loc:  Location,
    },

    #[snafu(display("failed spawning {name} thread"))]
    WorkerSpawn {
        name:   String,
        source: std::io::Error,
        #[snafu(implicit)]
        loc:    Location,
    },
}

impl Error {
    /// True when the operation lost a deadlock race and the caller may
    /// simply retry it in a fresh transaction.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store { source, .. } if source.is_deadlock())
    }
}
