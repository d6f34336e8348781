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

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::modules::backing_store::BackingStoreModule;
use crate::object_descriptor::ObjectDescriptor;

/// Maps base addresses to object descriptors.
///
/// The registry owns the descriptors; every other component refers to
/// objects by base address and looks them up again when needed. Fault
/// routing uses the predecessor lookup, so reads take a shared lock and
/// only insert/remove write.
pub(crate) struct ObjectRegistry<S: BackingStoreModule> {
    map: RwLock<BTreeMap<usize, Arc<ObjectDescriptor<S>>>>,
}

impl<S: BackingStoreModule> ObjectRegistry<S> {
    pub(crate) fn new() -> Self {
        ObjectRegistry {
            map: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn insert(&self, descriptor: Arc<ObjectDescriptor<S>>) {
        let base_addr = descriptor.geometry.base_addr;
        let previous = self.map.write().unwrap().insert(base_addr, descriptor);
        debug_assert!(previous.is_none(), "segment handed out twice");
    }

    pub(crate) fn remove(&self, base_addr: usize) -> Option<Arc<ObjectDescriptor<S>>> {
        self.map.write().unwrap().remove(&base_addr)
    }

    pub(crate) fn get(&self, base_addr: usize) -> Option<Arc<ObjectDescriptor<S>>> {
        self.map.read().unwrap().get(&base_addr).cloned()
    }

    /// Finds the descriptor whose range contains `addr`: predecessor by
    /// base address, then a bounds check.
    pub(crate) fn find_containing(&self, addr: usize) -> Option<Arc<ObjectDescriptor<S>>> {
        let map = self.map.read().unwrap();
        let (_, descriptor) = map.range(..=addr).next_back()?;
        if descriptor.geometry.contains_addr(addr) {
            Some(descriptor.clone())
        } else {
            None
        }
    }

    /// Snapshot of all live descriptors, for eviction scans.
    pub(crate) fn snapshot(&self) -> Vec<Arc<ObjectDescriptor<S>>> {
        self.map.read().unwrap().values().cloned().collect()
    }

    pub(crate) fn bases(&self) -> Vec<usize> {
        self.map.read().unwrap().keys().copied().collect()
    }

    #[allow(unused)]
    pub(crate) fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }
}
