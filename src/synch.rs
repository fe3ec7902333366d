// Copyright (c) 2025 vivo Mobile Communication Co., Ltd.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//       http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Synchronization objects: priority-ordered wait queues with optional
//! ownership and priority inheritance. The executive consumes the
//! forget-sleeper, renice-sleeper and release-all-ownerships capabilities;
//! the sleep/wakeup entry points live on the pod, which owns the thread
//! state machine.

use crate::thread::ThreadId;
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SynchFlags: u32 {
        /// Queue sleepers by priority rather than FIFO.
        const PRIO   = 1 << 0;
        /// The object tracks an owner and applies priority inheritance.
        const PIP    = 1 << 1;
        /// Dynamic requeuing on renice is disabled for this object.
        const DREORD = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SynchId {
    index: u32,
    gen: u32,
}

#[derive(Debug)]
pub(crate) struct Synch {
    pub(crate) status: SynchFlags,
    pub(crate) owner: Option<ThreadId>,
    /// Sleepers, wakeup order first.
    pub(crate) pendq: Vec<ThreadId>,
}

impl Synch {
    fn new(status: SynchFlags) -> Self {
        Self {
            status,
            owner: None,
            pendq: Vec::new(),
        }
    }

    /// Insert a sleeper. Priority queuing places it behind equal-priority
    /// peers; FIFO queuing always appends.
    pub(crate) fn insert_sleeper(&mut self, t: ThreadId, cprio: i32, prio_of: impl Fn(ThreadId) -> i32) {
        if self.status.contains(SynchFlags::PRIO) {
            let pos = self
                .pendq
                .iter()
                .position(|&s| prio_of(s) < cprio)
                .unwrap_or(self.pendq.len());
            self.pendq.insert(pos, t);
        } else {
            self.pendq.push(t);
        }
    }

    pub(crate) fn remove_sleeper(&mut self, t: ThreadId) {
        self.pendq.retain(|&s| s != t);
    }

    /// Move an already-queued sleeper to the slot its new priority earns.
    pub(crate) fn reorder_sleeper(&mut self, t: ThreadId, cprio: i32, prio_of: impl Fn(ThreadId) -> i32) {
        if !self.status.contains(SynchFlags::PRIO) || self.status.contains(SynchFlags::DREORD) {
            return;
        }
        self.remove_sleeper(t);
        self.insert_sleeper(t, cprio, prio_of);
    }

    /// Highest sleeper priority, if any.
    pub(crate) fn front_prio(&self, prio_of: impl Fn(ThreadId) -> i32) -> Option<i32> {
        self.pendq.iter().map(|&s| prio_of(s)).max()
    }
}

#[derive(Debug, Default)]
struct Slot {
    gen: u32,
    s: Option<Synch>,
}

#[derive(Debug, Default)]
pub(crate) struct SynchArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl SynchArena {
    pub(crate) fn create(&mut self, status: SynchFlags) -> SynchId {
        let s = Synch::new(status);
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.s = Some(s);
            SynchId {
                index,
                gen: slot.gen,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { gen: 0, s: Some(s) });
            SynchId { index, gen: 0 }
        }
    }

    pub(crate) fn get(&self, id: SynchId) -> Option<&Synch> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.s.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: SynchId) -> Option<&mut Synch> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.s.as_mut()
    }

    pub(crate) fn remove(&mut self, id: SynchId) -> Option<Synch> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        let s = slot.s.take()?;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id.index);
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(n: u32) -> ThreadId {
        ThreadId::new(n, 0)
    }

    #[test]
    fn prio_queue_orders_sleepers() {
        let mut s = Synch::new(SynchFlags::PRIO);
        let prio = |t: ThreadId| match t {
            t if t == tid(1) => 10,
            t if t == tid(2) => 50,
            _ => 30,
        };
        s.insert_sleeper(tid(1), 10, prio);
        s.insert_sleeper(tid(2), 50, prio);
        s.insert_sleeper(tid(3), 30, prio);
        assert_eq!(s.pendq, alloc::vec![tid(2), tid(3), tid(1)]);
        // Equal priority goes behind its peers.
        s.insert_sleeper(tid(4), 30, |t| if t == tid(4) { 30 } else { prio(t) });
        assert_eq!(s.pendq[2], tid(4));
    }

    #[test]
    fn fifo_queue_appends() {
        let mut s = Synch::new(SynchFlags::empty());
        s.insert_sleeper(tid(2), 50, |_| 0);
        s.insert_sleeper(tid(1), 90, |_| 0);
        assert_eq!(s.pendq, alloc::vec![tid(2), tid(1)]);
    }

    #[test]
    fn dreord_blocks_reorder() {
        let mut s = Synch::new(SynchFlags::PRIO | SynchFlags::DREORD);
        let prio = |_: ThreadId| 10;
        s.insert_sleeper(tid(1), 10, prio);
        s.insert_sleeper(tid(2), 10, prio);
        s.reorder_sleeper(tid(2), 99, |_| 99);
        assert_eq!(s.pendq, alloc::vec![tid(1), tid(2)]);
    }

    #[test]
    fn arena_recycles_with_generation_bump() {
        let mut arena = SynchArena::default();
        let a = arena.create(SynchFlags::PRIO);
        assert!(arena.get(a).is_some());
        arena.remove(a);
        assert!(arena.get(a).is_none());
        let b = arena.create(SynchFlags::empty());
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
    }
}
