//! Arena-backed flow table with generation-checked handles and an MRU
//! lookup fast path.
//!
//! Flows are addressed by stable handles instead of pointers; a handle left
//! over from a torn-down flow simply fails to resolve. Lookup is a scan
//! keyed by (local, foreign) with a one-slot most-recently-used cache in
//! front, since real traffic hits the same flow many times in a row.

use std::net::SocketAddr;

use crate::flow::Flow;

/// Which table a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowClass {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowHandle {
    class: FlowClass,
    index: u32,
    generation: u32,
}

impl FlowHandle {
    pub fn class(&self) -> FlowClass {
        self.class
    }
}

#[derive(Debug)]
struct Slot<S> {
    generation: u32,
    flow: Option<Flow<S>>,
}

#[derive(Debug)]
pub struct FlowTable<S> {
    class: FlowClass,
    slots: Vec<Slot<S>>,
    free: Vec<u32>,
    /// Most recently resolved handle; checked before scanning.
    last: Option<FlowHandle>,
    len: usize,
}

impl<S> FlowTable<S> {
    pub fn new(class: FlowClass) -> Self {
        Self {
            class,
            slots: Vec::new(),
            free: Vec::new(),
            last: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, flow: Flow<S>) -> FlowHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.flow = Some(flow);
            FlowHandle {
                class: self.class,
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                flow: Some(flow),
            });
            FlowHandle {
                class: self.class,
                index,
                generation: 0,
            }
        }
    }

    pub fn get(&self, handle: FlowHandle) -> Option<&Flow<S>> {
        let slot = self.slots.get(handle.index as usize)?;
        if handle.class != self.class || slot.generation != handle.generation {
            return None;
        }
        slot.flow.as_ref()
    }

    pub fn get_mut(&mut self, handle: FlowHandle) -> Option<&mut Flow<S>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if handle.class != self.class || slot.generation != handle.generation {
            return None;
        }
        slot.flow.as_mut()
    }

    /// Unlink and return the flow; the handle and any copies of it go
    /// stale, and the MRU slot is dropped if it pointed here.
    pub fn remove(&mut self, handle: FlowHandle) -> Option<Flow<S>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if handle.class != self.class || slot.generation != handle.generation {
            return None;
        }
        let flow = slot.flow.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        if self.last == Some(handle) {
            self.last = None;
        }
        Some(flow)
    }

    /// Find a flow by its (local, foreign) pair; a `None` foreign matches on
    /// the local address alone. Hits refresh the MRU slot.
    pub fn lookup(
        &mut self,
        local: &SocketAddr,
        foreign: Option<&SocketAddr>,
    ) -> Option<FlowHandle> {
        let matches = |flow: &Flow<S>| {
            flow.local == *local && foreign.is_none_or(|f| flow.foreign == *f)
        };

        if let Some(last) = self.last {
            if let Some(flow) = self.get(last) {
                if matches(flow) {
                    return Some(last);
                }
            }
        }

        for (index, slot) in self.slots.iter().enumerate() {
            if let Some(flow) = &slot.flow {
                if matches(flow) {
                    let handle = FlowHandle {
                        class: self.class,
                        index: index as u32,
                        generation: slot.generation,
                    };
                    self.last = Some(handle);
                    return Some(handle);
                }
            }
        }
        None
    }

    /// Snapshot of all live handles, safe to tear flows down while walking.
    pub fn handles(&self) -> Vec<FlowHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.flow.is_some())
            .map(|(index, slot)| FlowHandle {
                class: self.class,
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowKind;
    use crate::test_util::MockSocket;

    fn flow(local: &str, foreign: &str) -> Flow<MockSocket> {
        Flow::datagram(
            FlowKind::Udp,
            local.parse().unwrap(),
            foreign.parse().unwrap(),
        )
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut table = FlowTable::new(FlowClass::Datagram);
        let local: SocketAddr = "10.0.2.15:5000".parse().unwrap();
        let foreign: SocketAddr = "1.2.3.4:53".parse().unwrap();
        let handle = table.insert(flow("10.0.2.15:5000", "1.2.3.4:53"));

        assert_eq!(table.lookup(&local, Some(&foreign)), Some(handle));
        assert_eq!(table.lookup(&local, None), Some(handle));
        assert!(table.remove(handle).is_some());
        assert_eq!(table.lookup(&local, Some(&foreign)), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_handle_does_not_resolve() {
        let mut table = FlowTable::new(FlowClass::Datagram);
        let old = table.insert(flow("10.0.2.15:5000", "1.2.3.4:53"));
        table.remove(old);
        // Slot is reused with a bumped generation.
        let new = table.insert(flow("10.0.2.15:6000", "5.6.7.8:53"));
        assert!(table.get(old).is_none());
        assert!(table.get(new).is_some());
        assert!(table.remove(old).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_mru_slot_cleared_on_remove() {
        let mut table = FlowTable::new(FlowClass::Datagram);
        let local: SocketAddr = "10.0.2.15:5000".parse().unwrap();
        let handle = table.insert(flow("10.0.2.15:5000", "1.2.3.4:53"));
        assert_eq!(table.lookup(&local, None), Some(handle));
        table.remove(handle);
        assert_eq!(table.lookup(&local, None), None);
    }

    #[test]
    fn test_lookup_prefers_full_match_over_wildcard_miss() {
        let mut table = FlowTable::new(FlowClass::Datagram);
        let a = table.insert(flow("10.0.2.15:5000", "1.2.3.4:53"));
        let b = table.insert(flow("10.0.2.15:5000", "5.6.7.8:53"));
        let local: SocketAddr = "10.0.2.15:5000".parse().unwrap();
        let other: SocketAddr = "5.6.7.8:53".parse().unwrap();
        assert_eq!(table.lookup(&local, Some(&other)), Some(b));
        // The MRU entry still matches the wildcard lookup.
        assert_eq!(table.lookup(&local, None), Some(b));
        assert!(table.get(a).is_some());
    }
}
