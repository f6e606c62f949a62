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

//! Engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{InvalidSettingsSnafu, Result};

/// All recognized engine options with their defaults.
///
/// Interval options follow the rule that zero disables the corresponding
/// worker or feature: `dldetect_val`, `chkpoint_val`, `memp_trickle_val`
/// gate the three maintenance workers, `max_queue_size` gates both the
/// per-queue cap and length tracking, and `q_extentsize` gates extent
/// preallocation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Environment home directory.
    pub env_home: PathBuf,

    /// Buffer-pool size in bytes.
    pub cache_size: u64,

    /// Transaction log buffer size in bytes.
    pub txn_lg_bsize: usize,

    /// Queue record width in bytes.
    pub re_len: u32,

    /// Queue-file extent in records; 0 disables extents.
    pub q_extentsize: u32,

    /// Queue-file page size in bytes.
    pub page_size: u32,

    /// When set, commit does not fsync the log.
    pub txn_nosync: bool,

    /// Deadlock-detector period in microseconds; 0 disables.
    pub dldetect_val: u64,

    /// Checkpoint period in seconds; 0 disables.
    pub chkpoint_val: u64,

    /// Buffer-pool trickle period in seconds; 0 disables.
    pub memp_trickle_val: u64,

    /// Trickle clean-page target in percent.
    pub memp_trickle_percent: u32,

    /// Per-queue record cap; 0 disables the cap and length tracking.
    pub max_queue_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env_home:             PathBuf::from("./data"),
            cache_size:           64 * 1024 * 1024,
            txn_lg_bsize:         32 * 1024,
            re_len:               1024,
            q_extentsize:         131_072,
            page_size:            4096,
            txn_nosync:           false,
            dldetect_val:         100 * 1000,
            chkpoint_val:         60 * 5,
            memp_trickle_val:     30,
            memp_trickle_percent: 60,
            max_queue_size:       0,
        }
    }
}

impl Settings {
    /// Reject option combinations the storage layout cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < 512 {
            return InvalidSettingsSnafu {
                reason: format!("page_size {} is below the 512-byte minimum", self.page_size),
            }
            .fail();
        }
        if u64::from(self.re_len) + 4 > u64::from(self.page_size) {
            return InvalidSettingsSnafu {
                reason: format!(
                    "re_len {} plus the record header does not fit a {}-byte page",
                    self.re_len, self.page_size
                ),
            }
            .fail();
        }
        if self.memp_trickle_percent > 100 {
            return InvalidSettingsSnafu {
                reason: format!(
                    "memp_trickle_percent {} is not a percentage",
                    self.memp_trickle_percent
                ),
            }
            .fail();
        }
        Ok(())
    }

    /// True when a cap is configured and queue lengths are maintained.
    #[must_use]
    pub const fn length_tracking(&self) -> bool { self.max_queue_size > 0 }

    pub(crate) fn env_options(&self) -> queued_store::EnvOptions {
        queued_store::EnvOptions {
            home: self.env_home.clone(),
            cache_size: self.cache_size,
            page_size: self.page_size,
            log_buffer_size: self.txn_lg_bsize,
            txn_nosync: self.txn_nosync,
            ..Default::default()
        }
    }

    pub(crate) const fn fifo_params(&self) -> queued_store::FifoParams {
        queued_store::FifoParams {
            record_length: self.re_len,
            extent_size:   self.q_extentsize,
        }
    }
}
