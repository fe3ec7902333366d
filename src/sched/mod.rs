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

//! Per-CPU scheduler slots and the central rescheduling routine.

mod queue;

pub(crate) use queue::RunQueue;

use crate::{
    fpu,
    pod::{HookKind, Pod, PodState},
    sync::SpinIrqGuard,
    thread::{ThreadId, ThreadState},
    timer::TimerId,
    types::{CpuMask, Prio},
};
use bitflags::bitflags;
use core::mem;
use log::trace;

/// Scheduling class of a thread. Classes rank above priorities: a runnable
/// thread of a higher class always beats any lower-class one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedClass {
    /// Fixed-priority real-time class.
    Rt,
    /// Background class hosting the per-CPU root threads.
    Idle,
}

impl SchedClass {
    /// Priority as user interfaces expect to display it. The idle class
    /// reports the conventional background level.
    pub fn denormalized_prio(self, prio: Prio) -> Prio {
        match self {
            SchedClass::Rt => prio,
            SchedClass::Idle => -1,
        }
    }
}

bitflags! {
    /// Status word of one scheduler slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SchedStatus: u32 {
        /// A context switch is in flight with the pod lock released.
        const SWLOCK = 1 << 0;
        /// A hook chain is running on this CPU.
        const KCOUT  = 1 << 1;
        /// Cross-domain priority check requested.
        const RPICK  = 1 << 2;
    }
}

/// One CPU's scheduling state. The slot owns the ready structure; threads
/// back-reference it by CPU index.
#[derive(Debug)]
pub(crate) struct Scheduler {
    pub(crate) cpu: u32,
    pub(crate) status: SchedStatus,
    pub(crate) curr: ThreadId,
    pub(crate) root: ThreadId,
    pub(crate) fpuholder: Option<ThreadId>,
    /// CPUs this slot wants rescheduled, own bit included.
    pub(crate) resched: CpuMask,
    /// Outgoing thread preserved across an unlocked switch.
    pub(crate) last: Option<ThreadId>,
    /// Deleted thread awaiting finalization on this CPU.
    pub(crate) zombie: Option<ThreadId>,
    pub(crate) htimer: TimerId,
    pub(crate) wdtimer: TimerId,
    #[cfg(feature = "watchdog")]
    pub(crate) wd_count: u32,
    pub(crate) rq: RunQueue,
}

impl Scheduler {
    pub(crate) fn new(cpu: u32, root: ThreadId, htimer: TimerId, wdtimer: TimerId) -> Self {
        Self {
            cpu,
            status: SchedStatus::empty(),
            curr: root,
            root,
            fpuholder: None,
            resched: CpuMask::EMPTY,
            last: None,
            zombie: None,
            htimer,
            wdtimer,
            #[cfg(feature = "watchdog")]
            wd_count: 0,
            rq: RunQueue::new(),
        }
    }
}

impl Pod {
    /// Central rescheduling procedure. Validates and applies all scheduling
    /// state changes made since the last call, switching contexts as
    /// needed. A no-op from interrupt or callout context; callers stay
    /// oblivious of the gate.
    pub fn schedule(&self) {
        if self.arch.escalate() {
            return;
        }
        let g = self.state.lock_irqsave(self.arch);
        self.do_schedule(g);
    }

    /// Reschedule IPI handler. Serves a pending cross-domain priority
    /// probe, then forces a local pass through the scheduler.
    pub fn schedule_handler(&self) {
        let cpu = self.arch.current_cpu() as usize;
        {
            let mut g = self.state.lock_irqsave(self.arch);
            if g.scheds[cpu].status.contains(SchedStatus::RPICK) {
                g.scheds[cpu].status.remove(SchedStatus::RPICK);
                if let Some(b) = self.bridge() {
                    b.rpi_check();
                }
            }
            let cur = cpu as u32;
            g.scheds[cpu].resched.set(cur);
        }
        self.schedule();
    }

    /// Deferred variant used by interrupt epilogues: only runs the
    /// scheduler when something is actually pending locally.
    pub fn schedule_deferred(&self) {
        let pending = {
            let g = self.state.lock_irqsave(self.arch);
            let cpu = self.arch.current_cpu();
            g.active() && g.scheds[cpu as usize].resched.isset(cpu)
        };
        if pending {
            self.schedule();
        }
    }

    /// Consume the local resched bit and fan pending requests out to the
    /// other CPUs.
    pub(crate) fn test_resched(&self, s: &mut PodState, cpu: u32) -> bool {
        let sched = &mut s.scheds[cpu as usize];
        let resched = sched.resched.isset(cpu);
        sched.resched.clear(cpu);
        if !sched.resched.is_empty() {
            self.arch.send_ipi(sched.resched);
            sched.resched = CpuMask::EMPTY;
        }
        resched
    }

    /// Pick the thread to run next on `cpu`. The current thread keeps the
    /// CPU while it holds the scheduler lock; a runnable current thread is
    /// requeued ahead of its band so equal-priority peers do not leapfrog
    /// it. Falls back to the CPU's root thread when nothing is ready.
    pub(crate) fn pick_next(&self, s: &mut PodState, cpu: u32) -> ThreadId {
        let sched = &s.scheds[cpu as usize];
        let curr = sched.curr;
        let root = sched.root;
        let cstate = s.threads[curr].state;
        if !cstate.intersects(ThreadState::BLOCK_BITS.union(ThreadState::ZOMBIE)) {
            if cstate.contains(ThreadState::LOCKED) {
                return curr;
            }
            if !cstate.contains(ThreadState::READY) {
                self.requeue_ready(s, curr);
            }
        }
        let next = s.scheds[cpu as usize].rq.pick().unwrap_or(root);
        s.threads[next].state.remove(ThreadState::READY);
        next
    }

    pub(crate) fn do_schedule<'a>(&'a self, mut g: SpinIrqGuard<'a, PodState>) {
        let arch = self.arch;
        let cpu = arch.current_cpu();

        let need_resched = self.test_resched(&mut g, cpu);
        let curr = g.scheds[cpu as usize].curr;
        let zombie = g.threads[curr].state.contains(ThreadState::ZOMBIE);

        let next = self.pick_next(&mut g, cpu);
        if next == curr && !g.threads[curr].state.contains(ThreadState::RESTARTING) {
            // The root thread never restarts.
            if g.threads[curr].signaled() {
                self.dispatch_signals_locked(&mut g, cpu);
            }
            return;
        }
        debug_assert!(need_resched);

        let prev = curr;
        trace!(
            "cpu{} switch: {} -> {}",
            cpu,
            g.threads[prev].name(),
            g.threads[next].name()
        );

        let shadow = g.threads[prev].state.contains(ThreadState::SHADOW);

        if g.threads[next].state.contains(ThreadState::ROOT) {
            self.reset_watchdog(&mut g, cpu);
        }

        if zombie {
            self.zombie_hooks(&mut g, cpu, prev);
        }

        g.scheds[cpu as usize].curr = next;

        if g.threads[prev].state.contains(ThreadState::ROOT) {
            arch.leave_root(&mut g.threads[prev].tcb);
        } else if g.threads[next].state.contains(ThreadState::ROOT) {
            arch.enter_root(&mut g.threads[next].tcb);
        }

        // Swap the execution-time window and count the switch.
        let now = g.timers.jiffies();
        {
            let t = &mut g.threads[prev];
            t.stat.exec_time += now.saturating_sub(t.stat.exec_start);
        }
        {
            let t = &mut g.threads[next];
            t.stat.exec_start = now;
            t.stat.csw += 1;
        }

        // Arch TCB fields are the only thread state touched outside the
        // pod lock, during the switch itself.
        let restart_self = prev == next;
        let mut next_tcb = mem::take(&mut g.threads[next].tcb);
        let mut prev_tcb = if restart_self {
            None
        } else {
            Some(mem::take(&mut g.threads[prev].tcb))
        };

        let unlocked = arch.unlocked_switch();
        if unlocked {
            g.scheds[cpu as usize].status.insert(SchedStatus::SWLOCK);
            g.scheds[cpu as usize].last = Some(prev);
            drop(g);
            arch.switch_to(prev_tcb.as_mut(), &mut next_tcb);
            g = self.state.lock_irqsave(arch);
        } else {
            arch.switch_to(prev_tcb.as_mut(), &mut next_tcb);
        }

        if let Some(pt) = prev_tcb {
            if let Some(t) = g.threads.get_mut(prev) {
                t.tcb = pt;
            }
        }
        if let Some(t) = g.threads.get_mut(next) {
            t.tcb = next_tcb;
        }

        // The thread may have been migrated during the unlocked window;
        // work with a fresh CPU id from here on.
        let cpu = arch.current_cpu();
        if unlocked {
            self.finish_unlocked_switch(&mut g, cpu);
        }

        // Re-read the current thread: a relaxed shadow has turned into the
        // root thread on return.
        let curr = g.scheds[cpu as usize].curr;
        if shadow && g.threads[curr].state.contains(ThreadState::ROOT) {
            // We are the epilogue of the host scheduler after a relax.
            if let Some(b) = self.bridge() {
                if !b.thread_mapped(prev) {
                    drop(g);
                    b.exit();
                    let _relock = self.state.lock_irqsave(arch);
                    return;
                }
            }
            return;
        }

        if zombie && g.scheds[cpu as usize].curr == prev {
            let msg = alloc::format!(
                "zombie thread {:?} would not die",
                g.threads[prev].name()
            );
            self.fatal_locked(&mut g, &msg);
        }

        self.finalize_zombie(&mut g, cpu);

        fpu::switch_fpu(arch, &mut g, cpu);

        let curr = g.scheds[cpu as usize].curr;
        if !g.hooks.switch_.is_empty() && !g.threads[curr].state.contains(ThreadState::ROOT) {
            self.fire_callouts(&mut g, HookKind::Switch, curr);
        }

        let curr = g.scheds[cpu as usize].curr;
        if g.threads[curr].signaled() {
            self.dispatch_signals_locked(&mut g, cpu);
        }

        drop(g);
        if unlocked {
            self.resched_after_unlocked_switch();
        }
    }

    /// Fire the delete hook chain for an outgoing zombie and park it on
    /// the slot for the incoming thread to finalize.
    pub(crate) fn zombie_hooks(&self, s: &mut PodState, cpu: u32, prev: ThreadId) {
        if !s.threads[prev].state.contains(ThreadState::ROOT) && !s.hooks.delete.is_empty() {
            self.fire_callouts(s, HookKind::Delete, prev);
        }
        s.scheds[cpu as usize].zombie = Some(prev);
    }

    /// Reap the zombie parked on `cpu`, on behalf of the incoming thread.
    pub(crate) fn finalize_zombie(&self, s: &mut PodState, cpu: u32) {
        if let Some(z) = s.scheds[cpu as usize].zombie.take() {
            if let Some(t) = s.threads.get_mut(z) {
                self.arch.finalize_no_switch(&mut t.tcb);
            }
            s.threads.remove(z);
        }
    }

    /// Tail of an unlocked switch: place in-flight migrants on their new
    /// run queue and catch deletions deferred by remote CPUs.
    pub(crate) fn finish_unlocked_switch(&self, s: &mut PodState, cpu: u32) {
        s.scheds[cpu as usize].status.remove(SchedStatus::SWLOCK);
        let last = s.scheds[cpu as usize].last.take();
        if let Some(last) = last {
            let (migrating, zombie) = match s.threads.get(last) {
                Some(t) => (
                    t.state.contains(ThreadState::MIGRATING),
                    t.state.contains(ThreadState::ZOMBIE),
                ),
                None => return,
            };
            if migrating {
                s.threads[last].state.remove(ThreadState::MIGRATING);
                if s.threads[last].is_runnable() {
                    self.putback_locked(s, last);
                }
            } else if zombie && s.scheds[cpu as usize].zombie.is_none() {
                self.zombie_hooks(s, cpu, last);
            }
        }
    }

    fn resched_after_unlocked_switch(&self) {
        let pending = {
            let g = self.state.lock_irqsave(self.arch);
            let cpu = self.arch.current_cpu();
            g.scheds[cpu as usize].resched.isset(cpu)
        };
        if pending {
            self.schedule();
        }
    }

    pub(crate) fn reset_watchdog(&self, s: &mut PodState, cpu: u32) {
        #[cfg(feature = "watchdog")]
        {
            s.scheds[cpu as usize].wd_count = 0;
        }
        #[cfg(not(feature = "watchdog"))]
        {
            let _ = (s, cpu);
        }
    }
}
