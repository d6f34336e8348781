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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VLMError {
    /// The arena has no free segment large enough for the requested object.
    #[error("out of address space: requested {requested} bytes, largest free segment {available}")]
    OutOfAddressSpace { requested: usize, available: usize },

    /// Reading or writing the per-object backing file failed.
    #[error("backing store i/o failed: {0}")]
    BackingStoreIo(#[from] std::io::Error),

    /// The populate callback reported a nonzero status.
    #[error("populate callback failed with status {status}")]
    PopulateFailed { status: i32 },

    /// userfaultfd setup or one of its ioctls failed.
    #[error("kernel userfault operation `{op}` failed: {source}")]
    KernelUserfault {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The source description is unusable (zero sizes, mismatched dims, ...).
    #[error("invalid source: {0}")]
    InvalidSource(&'static str),

    /// No live object owns the given base address.
    #[error("no object registered at base address {base_addr:#x}")]
    NoSuchObject { base_addr: usize },

    /// The core has not been started (or was already shut down).
    #[error("core is not running")]
    NotRunning,

    /// Explicit init was requested while the core is already running.
    #[error("core is already running")]
    AlreadyRunning,
}
