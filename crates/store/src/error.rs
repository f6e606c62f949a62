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

/// Errors surfaced by the storage substrate.
///
/// Callers are expected to branch on two classes: [`Error::is_deadlock`]
/// marks a transaction that was chosen as a deadlock victim (abort and let
/// the caller retry), and [`Error::is_not_found`] marks an absent key, an
/// empty FIFO, or the end of a cursor (not a failure). Everything else is
/// structural.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("I/O failure"))]
    #[snafu(context(false))]
    Io {
        source: std::io::Error,
        #[snafu(implicit)]
        loc:    Location,
    },

    #[snafu(display("on-disk state is corrupted: {reason}"))]
    Corrupted {
        reason: String,
        #[snafu(implicit)]
        loc:    Location,
    },

    #[snafu(display("transaction aborted as deadlock victim"))]
    Deadlock {
        #[snafu(implicit)]
        loc: Location,
    },

    #[snafu(display("not found"))]
    NotFound {
        #[snafu(implicit)]
        loc: Location,
    },

    #[snafu(display("key already exists"))]
    KeyExists {
        #[snafu(implicit)]
        loc: Location,
    },

    #[snafu(display("record of {len} bytes exceeds the record length {record_length}"))]
    RecordTooLong {
        len:           usize,
        record_length: u32,
        #[snafu(implicit)]
        loc:           Location,
    },

    #[snafu(display("invalid environment options: {reason}"))]
    InvalidOptions {
        reason: String,
        #[snafu(implicit)]
        loc:    Location,
    },

    #[snafu(display("lock table is full: {reason}"))]
    LockTableFull {
        reason: String,
        #[snafu(implicit)]
        loc:    Location,
    },

    #[snafu(display("too many active transactions (limit {limit})"))]
    TooManyTransactions {
        limit: usize,
        #[snafu(implicit)]
        loc:   Location,
    },

    #[snafu(display("environment is panicked, recovery should be run"))]
    Panicked {
        #[snafu(implicit)]
        loc: Location,
    },
}

impl Error {
    /// True when the operation failed as a deadlock victim and may be
    /// retried by the caller in a fresh transaction.
    #[must_use]
    pub const fn is_deadlock(&self) -> bool { matches!(self, Self::Deadlock { .. }) }

    /// True for the non-error "absent" outcomes: unknown key, empty FIFO,
    /// end of cursor.
    #[must_use]
    pub const fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = DeadlockSnafu.build();
        assert!(err.is_deadlock());
        assert!(!err.is_not_found());

        let err = NotFoundSnafu.build();
        assert!(err.is_not_found());
        assert!(!err.is_deadlock());
    }

    #[test]
    fn test_io_error_conversion() {
        fn touch_missing() -> Result<std::fs::File> {
            let f = std::fs::File::open("/definitely/not/here")?;
            Ok(f)
        }
        assert!(matches!(touch_missing(), Err(Error::Io { .. })));
    }
}
