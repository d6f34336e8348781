/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};

/// Process-wide configuration, read once when the core starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VLMConfig {
    /// Size of the virtual address reservation all objects are carved from.
    /// Address space only, no physical commit.
    pub arena_bytes: usize,

    /// Global residency budget in bytes. Installs past this trigger eviction.
    pub budget_bytes: usize,

    /// Directory the per-object backing files are created in.
    pub scratch_dir: PathBuf,

    /// Number of populate/evict worker threads.
    pub worker_threads: usize,

    /// Capacity of the dispatcher-to-worker fault queue.
    pub queue_depth: usize,

    /// `min_load_elements` substituted when a source specifies zero.
    pub default_min_load_elements: u64,
}

impl Default for VLMConfig {
    fn default() -> Self {
        VLMConfig {
            arena_bytes: 256 << 30,
            budget_bytes: 1 << 30,
            scratch_dir: std::env::temp_dir(),
            worker_threads: 2,
            queue_depth: 64,
            default_min_load_elements: 16384,
        }
    }
}

impl VLMConfig {
    /// Builds a config from the defaults with `VLM_*` environment overrides
    /// (`VLM_ARENA_BYTES`, `VLM_BUDGET_BYTES`, `VLM_SCRATCH_DIR`,
    /// `VLM_WORKER_THREADS`, `VLM_QUEUE_DEPTH`, `VLM_MIN_LOAD_ELEMENTS`).
    /// Unparsable values keep the default and log a warning.
    pub fn from_env() -> Self {
        let mut config = VLMConfig::default();

        read_env("VLM_ARENA_BYTES", &mut config.arena_bytes);
        read_env("VLM_BUDGET_BYTES", &mut config.budget_bytes);
        read_env("VLM_WORKER_THREADS", &mut config.worker_threads);
        read_env("VLM_QUEUE_DEPTH", &mut config.queue_depth);
        read_env("VLM_MIN_LOAD_ELEMENTS", &mut config.default_min_load_elements);
        if let Ok(dir) = std::env::var("VLM_SCRATCH_DIR") {
            config.scratch_dir = PathBuf::from(dir);
        }

        config
    }

    /// Clamps nonsensical values so the core can always start.
    pub(crate) fn sanitized(mut self) -> Self {
        if self.worker_threads == 0 {
            self.worker_threads = 1;
        }
        if self.queue_depth == 0 {
            self.queue_depth = 1;
        }
        if self.default_min_load_elements == 0 {
            self.default_min_load_elements = 1;
        }
        self
    }
}

fn read_env<T: std::str::FromStr>(name: &str, dest: &mut T) {
    if let Ok(value) = std::env::var(name) {
        match value.parse() {
            Ok(parsed) => *dest = parsed,
            Err(_) => warn!("ignoring unparsable {}={}", name, value),
        }
    }
}

#[cfg(test)]
mod test {
    use super::VLMConfig;

    #[test]
    fn test_defaults_are_usable() {
        let config = VLMConfig::default().sanitized();
        assert!(config.arena_bytes > 0);
        assert!(config.budget_bytes > 0);
        assert!(config.worker_threads > 0);
        assert!(config.queue_depth > 0);
        assert!(config.default_min_load_elements > 0);
    }

    #[test]
    fn test_env_overrides() {
        // no other test touches these variables
        std::env::set_var("VLM_QUEUE_DEPTH", "7");
        std::env::set_var("VLM_BUDGET_BYTES", "not-a-number");

        let config = VLMConfig::from_env();
        assert_eq!(config.queue_depth, 7);
        // unparsable values keep the default
        assert_eq!(config.budget_bytes, VLMConfig::default().budget_bytes);

        std::env::remove_var("VLM_QUEUE_DEPTH");
        std::env::remove_var("VLM_BUDGET_BYTES");
    }

    #[test]
    fn test_sanitize_clamps_zeroes() {
        let mut config = VLMConfig::default();
        config.worker_threads = 0;
        config.queue_depth = 0;
        config.default_min_load_elements = 0;

        let config = config.sanitized();
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.queue_depth, 1);
        assert_eq!(config.default_min_load_elements, 1);
    }
}
