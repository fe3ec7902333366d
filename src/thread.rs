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

//! Thread descriptors. Descriptors live in a generation-checked arena
//! owned by the pod; the outside world holds [`ThreadId`] tokens. All
//! mutation happens under the pod lock.

use crate::{
    arch::{ArchTcb, ThreadEntry},
    sched::SchedClass,
    synch::SynchId,
    timer::TimerId,
    types::{CpuMask, Prio, Ticks},
};
use alloc::{string::String, vec::Vec};
use bitflags::bitflags;

/// Asynchronous service routine, called with the pod lock held and the
/// pending signal set as argument.
pub type Asr = fn(u32);

bitflags! {
    /// Thread state word. Several bits may be set at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadState: u32 {
        /// Created but not started yet.
        const DORMANT    = 1 << 0;
        /// Explicitly suspended.
        const SUSPENDED  = 1 << 1;
        /// Sleeping on a counted delay.
        const DELAYED    = 1 << 2;
        /// Pending on a synchronization object.
        const PENDING    = 1 << 3;
        /// Executing in the host domain (secondary mode).
        const RELAXED    = 1 << 4;
        /// Linked in a ready queue.
        const READY      = 1 << 5;
        /// Holds the scheduler lock.
        const LOCKED     = 1 << 6;
        /// Priority-inheritance boost in effect.
        const BOOSTED    = 1 << 7;
        /// Undergoing round-robin scheduling.
        const ROUND_ROBIN = 1 << 8;
        /// Uses the FPU.
        const FPU        = 1 << 9;
        /// Has a twin task managed by the host OS.
        const SHADOW     = 1 << 10;
        /// A CPU's idle/bootstrap thread.
        const ROOT       = 1 << 11;
        /// Deleted, awaiting final reap.
        const ZOMBIE     = 1 << 12;
        const STARTED    = 1 << 13;
        /// Restart requested on the current thread.
        const RESTARTING = 1 << 14;
        /// In flight between CPUs during an unlocked switch.
        const MIGRATING  = 1 << 15;
        /// Asynchronous signal handling disabled.
        const ASR_OFF    = 1 << 16;
        /// Interrupt shield engaged.
        const SHIELDED   = 1 << 17;
    }
}

impl ThreadState {
    /// A thread is runnable exactly when none of these is set.
    pub const BLOCK_BITS: ThreadState = ThreadState::from_bits_truncate(
        ThreadState::SUSPENDED.bits()
            | ThreadState::DELAYED.bits()
            | ThreadState::PENDING.bits()
            | ThreadState::DORMANT.bits()
            | ThreadState::RELAXED.bits(),
    );

    /// Control-mode bits settable through `set_thread_mode` and `start`.
    pub const MODE_BITS: ThreadState = ThreadState::from_bits_truncate(
        ThreadState::LOCKED.bits()
            | ThreadState::ROUND_ROBIN.bits()
            | ThreadState::ASR_OFF.bits()
            | ThreadState::SHIELDED.bits(),
    );

    /// Creation flags accepted by `init_thread`.
    pub const INIT_BITS: ThreadState = ThreadState::from_bits_truncate(
        ThreadState::FPU.bits()
            | ThreadState::SHADOW.bits()
            | ThreadState::SHIELDED.bits()
            | ThreadState::SUSPENDED.bits(),
    );

    pub fn is_runnable(self) -> bool {
        !self.intersects(ThreadState::BLOCK_BITS)
    }
}

bitflags! {
    /// Post-wakeup cause bits. Consumed by the awakened thread to work out
    /// why it resumed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadInfo: u32 {
        /// The delay elapsed or a watchdog fired before the wait completed.
        const TIMEDOUT   = 1 << 0;
        /// The pended synchronization object was destroyed.
        const SYNCH_GONE = 1 << 1;
        /// The wait was forcibly broken by `unblock_thread`.
        const BROKEN     = 1 << 2;
        /// The host kicked the shadow; the next suspend bails out.
        const KICKED     = 1 << 3;
        /// Woken up by an explicit wakeup on the wait channel.
        const WOKEN      = 1 << 4;
        /// The awaited resource was stolen by a higher-priority sleeper.
        const ROBBED     = 1 << 5;
        /// Priority change pending propagation to the host twin.
        const PRIO_SET   = 1 << 6;
    }
}

/// Per-thread counters and the execution-time measurement window.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadStats {
    /// Context switches into this thread.
    pub csw: u32,
    /// Page faults taken by the shadow.
    pub pf: u32,
    pub exec_start: Ticks,
    pub exec_time: Ticks,
}

#[derive(Debug)]
pub struct Thread {
    pub(crate) name: String,
    pub(crate) state: ThreadState,
    pub(crate) info: ThreadInfo,

    /// Base priority, as last set by renice.
    pub(crate) bprio: Prio,
    /// Effective priority; may sit above `bprio` under a boost.
    pub(crate) cprio: Prio,
    /// Priority given at creation, restored by restart.
    pub(crate) iprio: Prio,
    /// Priority band the thread is queued under while READY.
    pub(crate) rq_prio: Prio,

    pub(crate) base_class: SchedClass,
    pub(crate) sched_class: SchedClass,
    pub(crate) init_class: SchedClass,

    pub(crate) affinity: CpuMask,
    /// Owning scheduler slot.
    pub(crate) cpu: u32,

    pub(crate) rtimer: TimerId,
    pub(crate) ptimer: TimerId,
    pub(crate) wchan: Option<SynchId>,
    /// Synchronization objects currently owned, for bulk release.
    pub(crate) owned: Vec<SynchId>,

    pub(crate) signals: u32,
    pub(crate) asr: Option<Asr>,
    pub(crate) asr_mode: ThreadState,
    pub(crate) asr_imask: usize,
    pub(crate) asr_level: u32,

    pub(crate) lock_count: u32,

    pub(crate) rrperiod: Ticks,
    pub(crate) rrcredit: Ticks,

    pub(crate) entry: Option<ThreadEntry>,
    pub(crate) cookie: usize,
    /// Mode bits re-applied on restart.
    pub(crate) imode: ThreadState,
    pub(crate) imask: usize,
    pub(crate) stack_size: usize,

    pub(crate) stat: ThreadStats,
    pub(crate) tcb: ArchTcb,
}

impl Thread {
    pub(crate) fn new(name: &str, prio: Prio, flags: ThreadState, class: SchedClass) -> Self {
        Self {
            name: String::from(name),
            state: flags,
            info: ThreadInfo::empty(),
            bprio: prio,
            cprio: prio,
            iprio: prio,
            rq_prio: prio,
            base_class: class,
            sched_class: class,
            init_class: class,
            affinity: CpuMask::ALL,
            cpu: 0,
            rtimer: TimerId::INVALID,
            ptimer: TimerId::INVALID,
            wchan: None,
            owned: Vec::new(),
            signals: 0,
            asr: None,
            asr_mode: ThreadState::empty(),
            asr_imask: 0,
            asr_level: 0,
            lock_count: 0,
            rrperiod: 0,
            rrcredit: 0,
            entry: None,
            cookie: 0,
            imode: ThreadState::empty(),
            imask: 0,
            stack_size: 0,
            stat: ThreadStats::default(),
            tcb: ArchTcb::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn info(&self) -> ThreadInfo {
        self.info
    }

    pub fn current_priority(&self) -> Prio {
        self.cprio
    }

    pub fn base_priority(&self) -> Prio {
        self.bprio
    }

    pub fn initial_priority(&self) -> Prio {
        self.iprio
    }

    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn affinity(&self) -> CpuMask {
        self.affinity
    }

    pub fn wchan(&self) -> Option<SynchId> {
        self.wchan
    }

    pub fn stats(&self) -> ThreadStats {
        self.stat
    }

    pub fn signaled(&self) -> bool {
        self.signals != 0
    }

    pub(crate) fn is_runnable(&self) -> bool {
        self.state.is_runnable()
    }
}

/// Stable handle to an arena slot. Generation counters catch use of a
/// handle whose thread has been finalized and whose slot was reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    index: u32,
    gen: u32,
}

impl ThreadId {
    pub(crate) const fn new(index: u32, gen: u32) -> Self {
        Self { index, gen }
    }

    /// Arena slot number; stands in for a PID in diagnostics.
    pub(crate) fn index(self) -> u32 {
        self.index
    }
}

#[derive(Debug, Default)]
struct ArenaSlot {
    gen: u32,
    t: Option<Thread>,
}

/// Arena of thread descriptors; the authoritative identity table, akin to
/// a tid table that also owns the storage.
#[derive(Debug, Default)]
pub(crate) struct ThreadArena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
}

impl ThreadArena {
    pub(crate) fn insert(&mut self, t: Thread) -> ThreadId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.t.is_none());
            slot.t = Some(t);
            ThreadId::new(index, slot.gen)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(ArenaSlot { gen: 0, t: Some(t) });
            ThreadId::new(index, 0)
        }
    }

    pub(crate) fn get(&self, id: ThreadId) -> Option<&Thread> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.t.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.t.as_mut()
    }

    /// Free a slot, bumping its generation so stale handles die.
    pub(crate) fn remove(&mut self, id: ThreadId) -> Option<Thread> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        let t = slot.t.take()?;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id.index);
        Some(t)
    }

    pub(crate) fn contains(&self, id: ThreadId) -> bool {
        self.get(id).is_some()
    }
}

impl core::ops::Index<ThreadId> for ThreadArena {
    type Output = Thread;

    fn index(&self, id: ThreadId) -> &Thread {
        self.get(id).expect("stale thread handle")
    }
}

impl core::ops::IndexMut<ThreadId> for ThreadArena {
    fn index_mut(&mut self, id: ThreadId) -> &mut Thread {
        self.get_mut(id).expect("stale thread handle")
    }
}
