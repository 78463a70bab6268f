// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The request-id → request mapping for one connection.
//!
//! A dense array indexed by `id - 1`, with `None` marking a free slot.
//! Allocation scans for the first free slot before appending, which keeps
//! ids small and dense as spec §9's "Connection slot table" design note
//! asks for — this matches the FastCGI convention that ids are small
//! integers and is simpler than a map for the handful of slots any one
//! connection ever holds.

pub(crate) struct SlotTable<T> {
    slots: Vec<Option<T>>,
}

impl<T> SlotTable<T> {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Allocates the lowest free non-zero id and stores `value` there.
    pub(crate) fn allocate(&mut self, value: T) -> u16 {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(value);
                return (i + 1) as u16;
            }
        }
        self.slots.push(Some(value));
        self.slots.len() as u16
    }

    pub(crate) fn get(&self, id: u16) -> Option<&T> {
        self.slots.get(id.checked_sub(1)? as usize)?.as_ref()
    }

    /// Frees the slot for `id`, returning its value if it was live.
    pub(crate) fn free(&mut self, id: u16) -> Option<T> {
        self.slots.get_mut(id.checked_sub(1)? as usize)?.take()
    }

    /// Frees every slot, returning their values (used when a connection
    /// tears down with requests still pending).
    pub(crate) fn drain(&mut self) -> Vec<T> {
        self.slots.drain(..).flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_dense_ids_starting_at_one() {
        let mut table = SlotTable::new();
        assert_eq!(table.allocate("a"), 1);
        assert_eq!(table.allocate("b"), 2);
        assert_eq!(table.allocate("c"), 3);
    }

    #[test]
    fn reuses_freed_slots() {
        let mut table = SlotTable::new();
        let id1 = table.allocate("a");
        let _id2 = table.allocate("b");
        table.free(id1);
        let id3 = table.allocate("c");
        assert_eq!(id3, id1);
    }

    #[test]
    fn unknown_id_is_none() {
        let table: SlotTable<&str> = SlotTable::new();
        assert!(table.get(1).is_none());
        assert!(table.get(0).is_none());
    }
}
