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

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use super::BackingStoreModule;
use crate::vlm_error::VLMError;

/// Backing store on an anonymous temporary file.
///
/// The file is unlinked from birth, so it vanishes with the process no
/// matter how the process ends. Positional i/o keeps it usable from the
/// eviction and populate paths without seek state.
pub struct FileBackingStore {
    file: File,
    page_size: usize,
}

impl BackingStoreModule for FileBackingStore {
    fn open(scratch_dir: &Path, page_size: usize) -> Result<Self, VLMError> {
        debug_assert!(page_size > 0);

        let file = tempfile::tempfile_in(scratch_dir)?;
        Ok(FileBackingStore { file, page_size })
    }

    fn write_page(&mut self, page_index: usize, bytes: &[u8]) -> Result<(), VLMError> {
        debug_assert_eq!(bytes.len(), self.page_size);

        let offset = (page_index * self.page_size) as u64;
        self.file.write_all_at(bytes, offset)?;
        Ok(())
    }

    fn read_page(&mut self, page_index: usize, out_bytes: &mut [u8]) -> Result<(), VLMError> {
        debug_assert_eq!(out_bytes.len(), self.page_size);

        let offset = (page_index * self.page_size) as u64;
        self.file.read_exact_at(out_bytes, offset)?;
        Ok(())
    }
}
