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

//! The pod: container for every real-time thread, hook chain and per-CPU
//! scheduler of one address space. All state transitions run under the
//! pod's big lock; an operation may switch contexts only where it calls
//! into the scheduler.

use crate::{
    arch::{ArchOps, FaultInfo, ThreadEntry},
    error::{code, Result},
    fpu,
    sched::{SchedClass, SchedStatus, Scheduler},
    shadow::{ShadowBridge, SIGKILL},
    synch::{SynchArena, SynchFlags, SynchId},
    sync::SpinIrqLock,
    thread::{Asr, Thread, ThreadArena, ThreadId, ThreadInfo, ThreadState},
    timer::{TimerAction, TimerWheel},
    types::{CpuMask, Prio, STicks, Ticks, TimerMode, INFINITE, PRIO_MAX, PRIO_MIN, TICKS_PER_SEC},
};
use alloc::{format, string::String, vec::Vec};
use bitflags::bitflags;
use core::fmt::Write as _;
use log::{error, trace, warn};
use spin::Once;

/// Default stack size handed to threads created with a zero request.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024;

/// System heap carved from host memory at pod init.
const SYSHEAP_SIZE: usize = 256 * 1024;

/// Dedicated pool kernel thread stacks are carved from. Kept apart from
/// the system heap because some architectures cannot map virtually-mapped
/// memory while running the privileged trampoline.
const STACKPOOL_SIZE: usize = 128 * 1024;

#[cfg(feature = "watchdog")]
const WATCHDOG_THRESHOLD: u32 = 4;

/// Normal shutdown exit code.
pub const NORMAL_EXIT: i32 = 0;
/// Exit code used when the pod tears itself down after a fatal error.
pub const FATAL_EXIT: i32 = 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PodFlags: u32 {
        /// Pod is live.
        const PEXEC = 1 << 0;
        /// Fatal diagnostics in progress.
        const FATAL = 1 << 1;
        /// Master time base is ticking.
        const TBRUN = 1 << 2;
    }
}

/// Scheduling events a hook chain can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Start,
    Switch,
    Delete,
}

/// User routine attached to a hook chain. Runs under the pod lock with
/// the affected thread as argument; it must not re-enter the pod.
pub type HookFn = fn(&Thread);

#[derive(Debug, Default)]
pub(crate) struct Hooks {
    pub(crate) start: Vec<HookFn>,
    pub(crate) switch_: Vec<HookFn>,
    pub(crate) delete: Vec<HookFn>,
}

impl Hooks {
    fn list_mut(&mut self, kind: HookKind) -> &mut Vec<HookFn> {
        match kind {
            HookKind::Start => &mut self.start,
            HookKind::Switch => &mut self.switch_,
            HookKind::Delete => &mut self.delete,
        }
    }

    pub(crate) fn list(&self, kind: HookKind) -> &Vec<HookFn> {
        match kind {
            HookKind::Start => &self.start,
            HookKind::Switch => &self.switch_,
            HookKind::Delete => &self.delete,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MemRegion {
    base: usize,
    size: usize,
}

/// Outcome of a locked suspension, telling the caller which tail to run.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SuspendOutcome {
    Done,
    /// The target is a current thread: reschedule before returning.
    Schedule,
    /// A relaxed, non-current shadow must be forced back to primary mode.
    BridgeSuspend,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DeleteOutcome {
    Done,
    Schedule,
}

/// Everything the pod lock guards.
pub(crate) struct PodState {
    pub(crate) status: PodFlags,
    pub(crate) refcnt: u32,
    pub(crate) threads: ThreadArena,
    /// Global thread list in creation order.
    pub(crate) threadq: Vec<ThreadId>,
    pub(crate) threadq_rev: u32,
    pub(crate) hooks: Hooks,
    pub(crate) scheds: Vec<Scheduler>,
    /// Pod-wide CPU affinity applied to every started thread.
    pub(crate) affinity: CpuMask,
    pub(crate) timers: TimerWheel,
    pub(crate) synchs: SynchArena,
    msgbuf: String,
    sysheap: Option<MemRegion>,
    stackpool: Option<MemRegion>,
    stack_used: usize,
    /// Scheduling latency figure periodic requests are checked against.
    latency: Ticks,
    fpu_area_seq: u64,
}

impl PodState {
    fn new() -> Self {
        Self {
            status: PodFlags::empty(),
            refcnt: 0,
            threads: ThreadArena::default(),
            threadq: Vec::new(),
            threadq_rev: 0,
            hooks: Hooks::default(),
            scheds: Vec::new(),
            affinity: CpuMask::ALL,
            timers: TimerWheel::new(),
            synchs: SynchArena::default(),
            msgbuf: String::new(),
            sysheap: None,
            stackpool: None,
            stack_used: 0,
            latency: 0,
            fpu_area_seq: 0,
        }
    }

    pub(crate) fn active(&self) -> bool {
        self.status.contains(PodFlags::PEXEC)
    }

    fn next_fpu_area(&mut self) -> u64 {
        self.fpu_area_seq += 1;
        self.fpu_area_seq
    }
}

pub struct Pod {
    pub(crate) arch: &'static dyn ArchOps,
    pub(crate) state: SpinIrqLock<PodState>,
    bridge: Once<&'static dyn ShadowBridge>,
}

static INSTANCE: Once<Pod> = Once::new();

/// Build and start the process-wide pod. Idempotent: later callers only
/// bump the reference count.
pub fn init_instance(arch: &'static dyn ArchOps) -> Result<&'static Pod> {
    let pod = INSTANCE.call_once(|| Pod::new(arch));
    pod.init()?;
    Ok(pod)
}

pub fn instance() -> &'static Pod {
    INSTANCE.get().expect("pod not initialized")
}

pub(crate) fn instance_opt() -> Option<&'static Pod> {
    INSTANCE.get()
}

fn reschedule_ipi() {
    if let Some(pod) = instance_opt() {
        pod.schedule_handler();
    }
}

impl Pod {
    pub fn new(arch: &'static dyn ArchOps) -> Self {
        Self {
            arch,
            state: SpinIrqLock::new(PodState::new()),
            bridge: Once::new(),
        }
    }

    /// Attach the host-side relay enabling pervasive shadow support.
    pub fn install_bridge(&self, bridge: &'static dyn ShadowBridge) {
        self.bridge.call_once(|| bridge);
    }

    pub(crate) fn bridge(&self) -> Option<&'static dyn ShadowBridge> {
        self.bridge.get().copied()
    }

    // ---------------------------------------------------------------
    // Bootstrap.

    /// Bring the pod up: per-CPU slots, root threads, heaps, IPI handler,
    /// time source. Re-initializing a live pod only bumps its refcount.
    pub fn init(&self) -> Result {
        {
            let mut g = self.state.lock_irqsave(self.arch);
            if g.active() {
                g.refcnt += 1;
                return Ok(());
            }
        }

        let sys_base = self.arch.alloc_host_mem(SYSHEAP_SIZE)?;
        let stack_base = self.arch.alloc_stack_mem(STACKPOOL_SIZE)?;

        {
            let mut g = self.state.lock_irqsave(self.arch);
            g.status = PodFlags::empty();
            g.refcnt = 1;
            g.threadq_rev = 0;
            g.affinity = CpuMask::ALL;
            g.sysheap = Some(MemRegion {
                base: sys_base,
                size: SYSHEAP_SIZE,
            });
            g.stackpool = Some(MemRegion {
                base: stack_base,
                size: STACKPOOL_SIZE,
            });
            g.stack_used = 0;

            let ncpus = self.arch.num_online_cpus();
            for cpu in 0..ncpus {
                let mut root_state = ThreadState::ROOT | ThreadState::STARTED;
                #[cfg(feature = "fpu")]
                {
                    root_state |= ThreadState::FPU;
                }
                let mut root = Thread::new(&format!("ROOT/{cpu}"), 0, root_state, SchedClass::Idle);
                root.cpu = cpu;
                root.affinity = CpuMask::single(cpu);
                root.tcb.fpu_area = g.next_fpu_area();
                let rid = g.threads.insert(root);
                let rt = g.timers.create(TimerAction::ThreadTimeout(rid), cpu);
                let pt = g.timers.create(TimerAction::ThreadPeriod(rid), cpu);
                g.threads[rid].rtimer = rt;
                g.threads[rid].ptimer = pt;
                let htimer = g.timers.create(TimerAction::HostTick(cpu), cpu);
                let wdtimer = g.timers.create(TimerAction::Watchdog(cpu), cpu);
                g.scheds.push(Scheduler::new(cpu, rid, htimer, wdtimer));
                g.threadq.push(rid);
            }

            self.arch.hook_ipi(reschedule_ipi);

            g.status.insert(PodFlags::PEXEC);
            self.arch.memory_barrier();
        }

        if let Err(e) = self.enable_timesource() {
            self.shutdown(FATAL_EXIT);
            return Err(e);
        }
        Ok(())
    }

    /// Tear the pod down once the last reference goes away: every non-root
    /// thread is deleted, zombies are drained and the per-CPU slots are
    /// destroyed. Racing a new `init` against the final shutdown is
    /// undefined; the lock is intentionally released while the hardware
    /// timers stop.
    pub fn shutdown(&self, xtype: i32) {
        {
            let mut g = self.state.lock_irqsave(self.arch);
            if !g.active() {
                return;
            }
            g.refcnt -= 1;
            if g.refcnt != 0 {
                return;
            }
        }

        if xtype != NORMAL_EXIT {
            warn!("pod shutdown with exit code {xtype}");
        }

        self.disable_timesource();

        {
            let mut g = self.state.lock_irqsave(self.arch);
            let all: Vec<ThreadId> = g.threadq.clone();
            for tid in all {
                if g.threads.contains(tid) && !g.threads[tid].state.contains(ThreadState::ROOT) {
                    let _ = self.delete_locked(&mut g, tid);
                }
            }
        }

        // Drain any zombie left on the local CPU.
        self.schedule();

        let mut g = self.state.lock_irqsave(self.arch);
        g.status.remove(PodFlags::PEXEC);
        let (sysheap, stackpool) = {
            let st = &mut *g;
            let roots: Vec<ThreadId> = st.scheds.iter().map(|s| s.root).collect();
            for sc in &st.scheds {
                st.timers.destroy(sc.htimer);
                st.timers.destroy(sc.wdtimer);
            }
            for rid in roots {
                if let Some(t) = st.threads.get(rid) {
                    st.timers.destroy(t.rtimer);
                    st.timers.destroy(t.ptimer);
                }
                st.threadq.retain(|&x| x != rid);
                st.threads.remove(rid);
            }
            st.scheds.clear();
            (st.sysheap.take(), st.stackpool.take())
        };
        drop(g);

        if let Some(r) = sysheap {
            self.arch.free_host_mem(r.base, r.size);
        }
        if let Some(r) = stackpool {
            self.arch.free_stack_mem(r.base, r.size);
        }
    }

    /// Activate the master time source: attach the clock interrupt on
    /// every online CPU, start host-tick emulation where the hardware does
    /// not deliver it, and arm the per-CPU watchdog. The pod lock is never
    /// held across `start_timer`.
    pub fn enable_timesource(&self) -> Result {
        {
            let mut g = self.state.lock_irqsave(self.arch);
            if !g.active() {
                return Err(code::ENOSYS);
            }
            g.status.insert(PodFlags::TBRUN);
        }

        let ncpus = self.arch.num_online_cpus();
        for cpu in 0..ncpus {
            let htick = match self.arch.start_timer(cpu) {
                Ok(v) => v,
                Err(e) => {
                    for done in 0..cpu {
                        self.arch.stop_timer(done);
                    }
                    return Err(e);
                }
            };

            let mut g = self.state.lock_irqsave(self.arch);
            let htimer = g.scheds[cpu as usize].htimer;
            if htick > 0 {
                g.timers.start(htimer, htick, htick, TimerMode::Relative)?;
            } else {
                // Host ticks come straight from the hardware.
                g.timers.start(htimer, 0, 0, TimerMode::Relative)?;
            }
            #[cfg(feature = "watchdog")]
            {
                let wdtimer = g.scheds[cpu as usize].wdtimer;
                g.timers
                    .start(wdtimer, TICKS_PER_SEC, TICKS_PER_SEC, TimerMode::Relative)?;
                self.reset_watchdog(&mut g, cpu);
            }
        }
        Ok(())
    }

    /// Release the hardware timers and freeze the wheel. Stopping the
    /// timers runs without the pod lock held: holding it here deadlocks
    /// against remote clock interrupts.
    pub fn disable_timesource(&self) {
        {
            let mut g = self.state.lock_irqsave(self.arch);
            if !g.active() || !g.status.contains(PodFlags::TBRUN) {
                return;
            }
            g.status.remove(PodFlags::TBRUN);
        }

        for cpu in 0..self.arch.num_online_cpus() {
            self.arch.stop_timer(cpu);
        }

        let mut g = self.state.lock_irqsave(self.arch);
        g.timers.freeze();
    }

    /// One tick of the master time source. Expires due timers, performs
    /// round-robin accounting on the local current thread, then runs the
    /// scheduler.
    pub fn clock_interrupt(&self) {
        {
            let mut g = self.state.lock_irqsave(self.arch);
            if !g.active() || !g.status.contains(PodFlags::TBRUN) {
                return;
            }
            let actions = g.timers.tick();
            for action in actions {
                match action {
                    TimerAction::ThreadTimeout(t) => {
                        if g.threads.contains(t) {
                            g.threads[t].info.insert(ThreadInfo::TIMEDOUT);
                            self.resume_locked(&mut g, t, ThreadState::DELAYED);
                        }
                    }
                    TimerAction::ThreadPeriod(t) => {
                        if g.threads.contains(t)
                            && g.threads[t].state.contains(ThreadState::DELAYED)
                        {
                            self.resume_locked(&mut g, t, ThreadState::DELAYED);
                        }
                    }
                    TimerAction::HostTick(cpu) => self.arch.relay_host_tick(cpu),
                    TimerAction::Watchdog(cpu) => self.watchdog_tick(&mut g, cpu),
                }
            }

            // Round-robin accounting on the local current thread.
            let cpu = self.arch.current_cpu();
            let curr = g.scheds[cpu as usize].curr;
            let mut expired = false;
            {
                let t = &mut g.threads[curr];
                if t.state.contains(ThreadState::ROUND_ROBIN) && t.rrcredit != INFINITE {
                    t.rrcredit -= 1;
                    if t.rrcredit == 0 {
                        t.rrcredit = t.rrperiod;
                        expired = !t.state.contains(ThreadState::LOCKED);
                    }
                }
            }
            if expired {
                self.putback_locked(&mut g, curr);
            }
        }
        self.schedule();
    }

    #[cfg(feature = "watchdog")]
    fn watchdog_tick(&self, s: &mut PodState, cpu: u32) {
        let curr = s.scheds[cpu as usize].curr;
        if s.threads[curr].state.contains(ThreadState::ROOT) {
            self.reset_watchdog(s, cpu);
            return;
        }
        s.scheds[cpu as usize].wd_count += 1;
        if s.scheds[cpu as usize].wd_count >= WATCHDOG_THRESHOLD {
            error!(
                "watchdog triggered on CPU{cpu}: runaway thread {:?}",
                s.threads[curr].name()
            );
            if s.threads[curr].state.contains(ThreadState::SHADOW) {
                if let Some(b) = self.bridge() {
                    b.send_sig(curr, SIGKILL, true);
                }
            } else {
                let _ = self.delete_locked(s, curr);
            }
            self.reset_watchdog(s, cpu);
        }
    }

    #[cfg(not(feature = "watchdog"))]
    fn watchdog_tick(&self, _s: &mut PodState, _cpu: u32) {}

    /// Render the fatal thread table into the pod-wide message buffer and
    /// return a copy. The buffer stays valid until the next fatal report.
    pub fn fatal_helper(&self, msg: &str) -> String {
        let mut g = self.state.lock_irqsave(self.arch);
        self.fatal_helper_locked(&mut g, msg)
    }

    pub(crate) fn fatal_helper_locked(&self, s: &mut PodState, msg: &str) -> String {
        s.msgbuf.clear();
        s.msgbuf.push_str(msg);
        if !s.active() || s.status.contains(PodFlags::FATAL) {
            return s.msgbuf.clone();
        }
        s.status.insert(PodFlags::FATAL);

        let now = s.timers.jiffies();
        let mut buf = String::new();
        let _ = writeln!(buf);
        let _ = writeln!(
            buf,
            " {:<3}  {:<6} {:<8} {:<8} {:<8}  {}",
            "CPU", "PID", "PRI", "TIMEOUT", "STAT", "NAME"
        );
        for cpu in 0..s.scheds.len() {
            for &tid in &s.threadq {
                let Some(t) = s.threads.get(tid) else { continue };
                if t.cpu as usize != cpu {
                    continue;
                }
                let cprio = t.cprio;
                let dnprio = t.sched_class.denormalized_prio(cprio);
                let pbuf = if dnprio != cprio {
                    format!("{cprio}({dnprio})")
                } else {
                    format!("{cprio}")
                };
                let marker = if s.scheds[cpu].curr == tid { '>' } else { ' ' };
                let _ = writeln!(
                    buf,
                    "{}{:<3}  {:<6} {:<8} {:<8} {:08x}  {}",
                    marker,
                    cpu,
                    tid.index(),
                    pbuf,
                    s.timers.get_timeout(t.rtimer, now),
                    t.state.bits(),
                    t.name()
                );
            }
        }
        if s.status.contains(PodFlags::TBRUN) {
            let _ = writeln!(buf, "Master time base: clock={now}");
        } else {
            let _ = writeln!(buf, "Master time base: disabled");
        }
        let _ = writeln!(buf, "Current CPU: #{}", self.arch.current_cpu());

        s.msgbuf.push_str(&buf);
        s.msgbuf.clone()
    }

    /// Fatal halt for impossible states: dump every thread, then panic.
    pub(crate) fn fatal_locked(&self, s: &mut PodState, msg: &str) -> ! {
        let report = self.fatal_helper_locked(s, msg);
        panic!("{}", report);
    }

    /// Precondition violations panic in debug builds; release builds fall
    /// back to the caller's error return.
    fn debug_fatal(&self, s: &mut PodState, msg: &str) {
        if cfg!(debug_assertions) {
            self.fatal_locked(s, msg);
        }
    }

    // ---------------------------------------------------------------
    // Thread lifecycle.

    /// Create a thread attached to the pod, left dormant until started.
    /// The stack is carved from the dedicated pool.
    pub fn init_thread(
        &self,
        name: &str,
        prio: Prio,
        flags: ThreadState,
        stack_size: usize,
        class: SchedClass,
    ) -> Result<ThreadId> {
        if !ThreadState::INIT_BITS.contains(flags) {
            return Err(code::EINVAL);
        }
        if !(PRIO_MIN..=PRIO_MAX).contains(&prio) {
            return Err(code::EINVAL);
        }
        let mut flags = flags;
        #[cfg(not(feature = "shield"))]
        flags.remove(ThreadState::SHIELDED);
        let stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };

        let mut g = self.state.lock_irqsave(self.arch);
        if !g.active() {
            return Err(code::ENOSYS);
        }
        if g.stack_used + stack_size > g.stackpool.map(|r| r.size).unwrap_or(0) {
            return Err(code::ENOMEM);
        }
        g.stack_used += stack_size;

        // Exclude the suspension bit here so the suspend path below does
        // the actual work for it.
        let mut t = Thread::new(name, prio, flags - ThreadState::SUSPENDED, class);
        let cpu = self.arch.current_cpu();
        t.cpu = cpu;
        t.stack_size = stack_size;
        t.tcb.stack_size = stack_size;
        t.tcb.fpu_area = g.next_fpu_area();
        let tid = g.threads.insert(t);
        let rt = g.timers.create(TimerAction::ThreadTimeout(tid), cpu);
        let pt = g.timers.create(TimerAction::ThreadPeriod(tid), cpu);
        g.threads[tid].rtimer = rt;
        g.threads[tid].ptimer = pt;
        g.threadq.push(tid);
        g.threadq_rev += 1;

        trace!("thread init: {:?} prio={prio}", g.threads[tid].name());

        let mask = ThreadState::DORMANT | (flags & ThreadState::SUSPENDED);
        let _ = self.suspend_locked(&mut g, tid, mask, INFINITE, TimerMode::Relative, None)?;
        Ok(tid)
    }

    /// First start of a dormant thread: resolve its affinity, apply the
    /// initial mode, build the initial stack frame and make it ready.
    pub fn start_thread(
        &self,
        tid: ThreadId,
        mode: ThreadState,
        imask: usize,
        affinity: CpuMask,
        entry: Option<ThreadEntry>,
        cookie: usize,
    ) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        if !g.threads[tid].state.contains(ThreadState::DORMANT) {
            return Err(code::EBUSY);
        }

        let affinity = affinity.and(g.affinity);
        let eff = affinity.and(self.arch.cpu_online_map());
        if eff.is_empty() {
            return Err(code::EINVAL);
        }
        g.threads[tid].affinity = eff;
        if !eff.isset(g.threads[tid].cpu) {
            let new_cpu = eff.first().unwrap();
            g.threads[tid].cpu = new_cpu;
            let (rt, pt) = (g.threads[tid].rtimer, g.threads[tid].ptimer);
            g.timers.set_sched(rt, new_cpu);
            g.timers.set_sched(pt, new_cpu);
        }
        if g.threads[tid].state.contains(ThreadState::STARTED) {
            return Err(code::EBUSY);
        }

        let mut mode = mode;
        #[cfg(not(feature = "shield"))]
        mode.remove(ThreadState::SHIELDED);

        {
            let t = &mut g.threads[tid];
            t.state
                .insert((mode & (ThreadState::MODE_BITS | ThreadState::SUSPENDED)) | ThreadState::STARTED);
            t.imask = imask;
            t.imode = mode & ThreadState::MODE_BITS;
            t.entry = entry;
            t.cookie = cookie;
            if t.state.contains(ThreadState::ROUND_ROBIN) {
                t.rrcredit = t.rrperiod;
            }
        }

        trace!("thread start: {:?}", g.threads[tid].name());

        if g.threads[tid].state.contains(ThreadState::SHADOW) {
            drop(g);
            if let Some(b) = self.bridge() {
                b.start(tid);
            }
            self.schedule();
            return Ok(());
        }

        // Set up the initial stack frame.
        {
            let name = g.threads[tid].name.clone();
            let t = &mut g.threads[tid];
            self.arch.init_thread(&mut t.tcb, entry, cookie, imask, &name);
        }

        self.resume_locked(&mut g, tid, ThreadState::DORMANT);

        if !g.hooks.start.is_empty() && !g.threads[tid].state.contains(ThreadState::ROOT) {
            self.fire_callouts(&mut g, HookKind::Start, tid);
        }

        self.do_schedule(g);
        Ok(())
    }

    /// Terminate and respawn a started thread with the information that
    /// prevailed at its first start. Roots and user-space shadows cannot
    /// restart.
    pub fn restart_thread(&self, tid: ThreadId) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        if !g.threads[tid].state.contains(ThreadState::STARTED) {
            return Ok(());
        }
        if g.threads[tid]
            .state
            .intersects(ThreadState::ROOT | ThreadState::SHADOW)
        {
            self.debug_fatal(&mut g, "attempt to restart a root or user-space thread");
            return Err(code::EPERM);
        }

        trace!("thread restart: {:?}", g.threads[tid].name());

        // Break the thread out of any wait it is currently in.
        self.unblock_locked(&mut g, tid);

        self.release_all_ownerships(&mut g, tid);

        if g.threads[tid].state.contains(ThreadState::SUSPENDED) {
            self.resume_locked(&mut g, tid, ThreadState::SUSPENDED);
        }

        {
            let t = &mut g.threads[tid];
            t.state.remove(ThreadState::MODE_BITS);
            let imode = t.imode;
            t.state.insert(imode);
            t.cprio = t.iprio;
            t.bprio = t.iprio;
            t.sched_class = t.init_class;
            t.base_class = t.init_class;
            t.signals = 0;
        }

        let cpu = self.arch.current_cpu();
        if g.scheds[cpu as usize].curr == tid {
            {
                let t = &mut g.threads[tid];
                if t.state.contains(ThreadState::LOCKED) {
                    t.state.remove(ThreadState::LOCKED);
                    t.lock_count = 0;
                }
                // Force the switch-to-self through the normal path.
                t.state.insert(ThreadState::RESTARTING);
            }
            self.set_resched(&mut g, cpu);
        }

        // Rebuild the initial stack frame.
        {
            let name = g.threads[tid].name.clone();
            let t = &mut g.threads[tid];
            let (entry, cookie, imask) = (t.entry, t.cookie, t.imask);
            self.arch.init_thread(&mut t.tcb, entry, cookie, imask, &name);
        }

        self.do_schedule(g);
        Ok(())
    }

    /// Delete a thread, releasing every resource it holds. Self-deletion
    /// finalizes on the next switch; deleting a mapped shadow from kernel
    /// context hands the twin a lethal signal instead and defers the
    /// actual deletion to its exit path.
    pub fn delete_thread(&self, tid: ThreadId) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            // Already finalized; deletion is idempotent.
            return Ok(());
        }
        if g.threads[tid].state.contains(ThreadState::ROOT) {
            self.debug_fatal(&mut g, "attempt to delete the root thread");
            return Err(code::EPERM);
        }
        match self.delete_locked(&mut g, tid) {
            DeleteOutcome::Schedule => self.do_schedule(g),
            DeleteOutcome::Done => {}
        }
        Ok(())
    }

    pub(crate) fn delete_locked(&self, s: &mut PodState, tid: ThreadId) -> DeleteOutcome {
        if s.threads[tid].state.contains(ThreadState::ZOMBIE) {
            // No double-deletion.
            return DeleteOutcome::Done;
        }

        let cpu = self.arch.current_cpu();
        let curr = s.scheds[cpu as usize].curr;

        // Mapped shadows must exit on behalf of their own context: kernel
        // callers hand the twin a lethal signal and bail out.
        if self.bridge().is_some()
            && s.threads[tid].tcb.user_task
            && !s.threads[tid].state.contains(ThreadState::DORMANT)
            && curr != tid
        {
            if !s.threads[curr].state.contains(ThreadState::SHADOW) {
                if let Some(b) = self.bridge() {
                    b.send_sig(tid, SIGKILL, true);
                }
            }
            return DeleteOutcome::Done;
        }

        trace!("thread delete: {:?}", s.threads[tid].name());

        s.threadq.retain(|&x| x != tid);
        s.threadq_rev += 1;

        if s.threads[tid].state.contains(ThreadState::READY) {
            debug_assert!(!s.threads[tid].state.intersects(ThreadState::BLOCK_BITS));
            self.dequeue_ready(s, tid);
        }

        let (rt, pt) = (s.threads[tid].rtimer, s.threads[tid].ptimer);
        s.timers.destroy(rt);
        s.timers.destroy(pt);

        if s.threads[tid].state.contains(ThreadState::PENDING) {
            self.forget_sleeper(s, tid);
        }

        self.release_all_ownerships(s, tid);

        fpu::giveup_fpu(s, tid);

        s.threads[tid].state.insert(ThreadState::ZOMBIE);

        let tcpu = s.threads[tid].cpu;
        if s.scheds[tcpu as usize].curr == tid {
            // Pick a new current thread first; the switch tail destroys
            // the zombie.
            self.set_resched(s, tcpu);
            DeleteOutcome::Schedule
        } else if self.arch.unlocked_switch()
            && (s.scheds[tcpu as usize].status.contains(SchedStatus::SWLOCK)
                || s.threads[tid].state.contains(ThreadState::MIGRATING))
        {
            // Killed in the course of a context switch or in flight to
            // another CPU: the unlocked-switch tail reaps it.
            DeleteOutcome::Done
        } else {
            if !s.hooks.delete.is_empty() && !s.threads[tid].state.contains(ThreadState::ROOT) {
                self.fire_callouts(s, HookKind::Delete, tid);
            }
            self.reap_thread(s, tid);
            DeleteOutcome::Done
        }
    }

    /// Final disposal: arch finalization, stack accounting, slot release.
    /// The control block stays valid until the hooks have run.
    pub(crate) fn reap_thread(&self, s: &mut PodState, tid: ThreadId) {
        if let Some(t) = s.threads.get_mut(tid) {
            let stack = t.stack_size;
            self.arch.finalize_no_switch(&mut t.tcb);
            s.stack_used = s.stack_used.saturating_sub(stack);
        }
        s.threads.remove(tid);
    }

    /// Unconditional termination: force-suspend first when the target is
    /// not the caller, then delete.
    pub fn abort_thread(&self, tid: ThreadId) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        let cpu = self.arch.current_cpu();
        if g.scheds[cpu as usize].curr != tid {
            let _ = self.suspend_locked(
                &mut g,
                tid,
                ThreadState::DORMANT,
                INFINITE,
                TimerMode::Relative,
                None,
            )?;
        }
        if g.threads[tid].state.contains(ThreadState::ROOT) {
            self.debug_fatal(&mut g, "attempt to delete the root thread");
            return Err(code::EPERM);
        }
        match self.delete_locked(&mut g, tid) {
            DeleteOutcome::Schedule => self.do_schedule(g),
            DeleteOutcome::Done => {}
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Suspend / resume engine.

    /// Add a suspensive condition to a thread. A current target culminates
    /// in a reschedule before return.
    ///
    /// When an absolute timeout has already elapsed, the wait channel is
    /// latched on the descriptor and immediately forgotten so the sleeper
    /// queue cancels cleanly, the timeout cause is flagged and the run
    /// queue is left untouched; the caller must not forget the sleeper
    /// itself after observing the timeout cause.
    pub fn suspend_thread(
        &self,
        tid: ThreadId,
        mask: ThreadState,
        timeout: Ticks,
        mode: TimerMode,
        wchan: Option<SynchId>,
    ) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        match self.suspend_locked(&mut g, tid, mask, timeout, mode, wchan)? {
            SuspendOutcome::Schedule => self.do_schedule(g),
            SuspendOutcome::BridgeSuspend => {
                if let Some(b) = self.bridge() {
                    b.suspend(tid);
                }
            }
            SuspendOutcome::Done => {}
        }
        Ok(())
    }

    pub(crate) fn suspend_locked(
        &self,
        s: &mut PodState,
        tid: ThreadId,
        mask: ThreadState,
        timeout: Ticks,
        mode: TimerMode,
        wchan: Option<SynchId>,
    ) -> Result<SuspendOutcome> {
        debug_assert!(ThreadState::BLOCK_BITS.contains(mask));

        if s.threads[tid].state.contains(ThreadState::ROOT) {
            self.debug_fatal(s, "attempt to suspend the root thread");
            return Err(code::EPERM);
        }
        if let (Some(old), Some(new)) = (s.threads[tid].wchan, wchan) {
            if old != new {
                self.debug_fatal(s, "thread attempts a conjunctive wait");
                return Err(code::EINVAL);
            }
        }

        trace!(
            "thread suspend: {:?} mask={:?} timeout={timeout}",
            s.threads[tid].name(),
            mask
        );

        let tcpu = s.threads[tid].cpu;
        if s.scheds[tcpu as usize].curr == tid {
            self.set_resched(s, tcpu);
        }

        if s.threads[tid].is_runnable() {
            // A runnable shadow kicked by the host is never suspended:
            // raise the break condition and bail out, so the kick cannot
            // be lost. A relaxed shadow never carries the kick, keeping
            // its own demotion free to block.
            if self.bridge().is_some() && s.threads[tid].info.contains(ThreadInfo::KICKED) {
                debug_assert!(!mask.contains(ThreadState::RELAXED));
                let t = &mut s.threads[tid];
                t.info.remove(ThreadInfo::SYNCH_GONE | ThreadInfo::TIMEDOUT);
                t.info.insert(ThreadInfo::BROKEN);
                return Ok(SuspendOutcome::Done);
            }
            s.threads[tid].info.remove(
                ThreadInfo::SYNCH_GONE
                    | ThreadInfo::TIMEDOUT
                    | ThreadInfo::BROKEN
                    | ThreadInfo::WOKEN
                    | ThreadInfo::ROBBED,
            );
        }

        // Don't arm the timer for an unbounded relative delay.
        if timeout != INFINITE || mode != TimerMode::Relative {
            let rtimer = s.threads[tid].rtimer;
            s.timers.set_sched(rtimer, tcpu);
            if s.timers.start(rtimer, timeout, INFINITE, mode).is_err() {
                // The absolute deadline is already past.
                if let Some(w) = wchan {
                    s.threads[tid].wchan = Some(w);
                    self.forget_sleeper(s, tid);
                }
                s.threads[tid].info.insert(ThreadInfo::TIMEDOUT);
                return Ok(SuspendOutcome::Done);
            }
            s.threads[tid].state.insert(ThreadState::DELAYED);
        }

        if s.threads[tid].state.contains(ThreadState::READY) {
            self.dequeue_ready(s, tid);
        }

        s.threads[tid].state.insert(mask);

        // Never clear an already-set wait channel here: blocked-then-
        // forcibly-suspended are conjunctive conditions.
        if let Some(w) = wchan {
            s.threads[tid].wchan = Some(w);
        }

        if s.scheds[tcpu as usize].curr == tid {
            return Ok(SuspendOutcome::Schedule);
        }

        // Suspending a non-current, relaxed shadow: the executive cannot
        // stop a thread the host scheduler is running; force it back to
        // primary mode first.
        let st = s.threads[tid].state;
        if self.bridge().is_some()
            && st & (ThreadState::SHADOW | ThreadState::RELAXED | ThreadState::DORMANT)
                == ThreadState::SHADOW | ThreadState::RELAXED
            && mask.intersects(ThreadState::DELAYED | ThreadState::SUSPENDED)
        {
            return Ok(SuspendOutcome::BridgeSuspend);
        }

        Ok(SuspendOutcome::Done)
    }

    /// Remove a suspensive condition. When the last one goes away the
    /// thread returns to its run queue; never reschedules.
    pub fn resume_thread(&self, tid: ThreadId, mask: ThreadState) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        self.resume_locked(&mut g, tid, mask);
        Ok(())
    }

    pub(crate) fn resume_locked(&self, s: &mut PodState, tid: ThreadId, mask: ThreadState) {
        trace!(
            "thread resume: {:?} mask={:?}",
            s.threads[tid].name(),
            mask
        );

        let tcpu = s.threads[tid].cpu;

        if !s.threads[tid].state.intersects(ThreadState::BLOCK_BITS) {
            // A renice-induced requeue of a runnable thread.
            if s.threads[tid].state.contains(ThreadState::READY) {
                self.dequeue_ready(s, tid);
            }
        } else {
            s.threads[tid].state.remove(mask);
            if mask.contains(ThreadState::DELAYED) {
                let rt = s.threads[tid].rtimer;
                s.timers.stop(rt);
            }

            if s.threads[tid].state.intersects(ThreadState::BLOCK_BITS) {
                let wchan_mask;
                if mask.contains(ThreadState::DELAYED) {
                    // The delay fell; only a pend on a resource may keep
                    // the thread down from here.
                    if !s.threads[tid].state.contains(ThreadState::PENDING) {
                        return;
                    }
                    wchan_mask = ThreadState::PENDING;
                    if s.threads[tid].wchan.is_some() {
                        self.forget_sleeper(s, tid);
                        if s.threads[tid].state.intersects(ThreadState::BLOCK_BITS) {
                            return;
                        }
                    }
                } else if s.threads[tid].state.contains(ThreadState::DELAYED) {
                    if mask.contains(ThreadState::PENDING) {
                        // The resource arrived first: disarm the watchdog.
                        let rt = s.threads[tid].rtimer;
                        s.timers.stop(rt);
                        s.threads[tid].state.remove(ThreadState::DELAYED);
                    }
                    if s.threads[tid].state.intersects(ThreadState::BLOCK_BITS) {
                        return;
                    }
                    wchan_mask = mask;
                } else {
                    // Still suspended, but no longer pending on a
                    // resource.
                    if mask.contains(ThreadState::PENDING) && s.threads[tid].wchan.is_some() {
                        self.forget_sleeper(s, tid);
                    }
                    return;
                }

                if !(wchan_mask - ThreadState::DELAYED).is_empty()
                    && s.threads[tid].wchan.is_some()
                {
                    self.forget_sleeper(s, tid);
                }
            } else if !(mask - ThreadState::DELAYED).is_empty() && s.threads[tid].wchan.is_some() {
                // The thread was actually suspended: clear the wait
                // channel. A plain delay wakeup leaves a latched channel
                // alone.
                self.forget_sleeper(s, tid);
            }
        }

        self.enqueue_ready(s, tid);
        self.set_resched(s, tcpu);
    }

    /// Break a thread out of a delay or resource wait. Touches neither
    /// explicit suspension, relaxation nor dormancy. Returns whether a
    /// wait was actually interrupted; only then is the break cause raised,
    /// and it stays raised until the thread runs again.
    pub fn unblock_thread(&self, tid: ThreadId) -> Result<bool> {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        Ok(self.unblock_locked(&mut g, tid))
    }

    pub(crate) fn unblock_locked(&self, s: &mut PodState, tid: ThreadId) -> bool {
        let mut ret = true;
        if s.threads[tid].state.contains(ThreadState::DELAYED) {
            self.resume_locked(s, tid, ThreadState::DELAYED);
        } else if s.threads[tid].state.contains(ThreadState::PENDING) {
            self.resume_locked(s, tid, ThreadState::PENDING);
        } else {
            ret = false;
        }
        // A break raised here must always surface downstream, and an
        // already-runnable thread must never look interrupted.
        if ret {
            s.threads[tid].info.insert(ThreadInfo::BROKEN);
        }
        ret
    }

    /// Change the base priority of a thread, honoring an undergoing
    /// priority-inheritance boost. Assigning the same priority to a
    /// runnable thread moves it behind its peers, producing a manual
    /// round-robin. Never reschedules.
    pub fn renice_thread(&self, tid: ThreadId, prio: Prio) -> Result {
        if !(PRIO_MIN..=PRIO_MAX).contains(&prio) {
            return Err(code::EINVAL);
        }
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        self.renice_inner(&mut g, tid, prio, true);
        Ok(())
    }

    pub(crate) fn renice_inner(&self, s: &mut PodState, tid: ThreadId, prio: Prio, propagate: bool) {
        trace!("thread renice: {:?} prio={prio}", s.threads[tid].name());

        let oldprio = s.threads[tid].cprio;
        s.threads[tid].bprio = prio;

        // Never lower the effective priority of a boosted thread.
        if !s.threads[tid].state.contains(ThreadState::BOOSTED) || prio > oldprio {
            s.threads[tid].cprio = prio;
            if prio != oldprio && s.threads[tid].wchan.is_some() {
                self.renice_sleeper(s, tid);
            }
            if !s.threads[tid]
                .state
                .intersects(ThreadState::BLOCK_BITS | ThreadState::LOCKED)
            {
                self.putback_locked(s, tid);
            }
        }

        if propagate {
            if let Some(b) = self.bridge() {
                if s.threads[tid].state.contains(ThreadState::RELAXED) {
                    b.renice(tid, prio);
                } else if s.threads[tid].state.contains(ThreadState::SHADOW) {
                    s.threads[tid].info.insert(ThreadInfo::PRIO_SET);
                }
            }
        }
    }

    /// Effective-priority change used by the priority-inheritance engine:
    /// reorders wait queues and run queues without touching the base
    /// priority.
    pub(crate) fn renice_cprio(&self, s: &mut PodState, tid: ThreadId, prio: Prio) {
        s.threads[tid].cprio = prio;
        if s.threads[tid].wchan.is_some() {
            self.renice_sleeper(s, tid);
        }
        if !s.threads[tid]
            .state
            .intersects(ThreadState::BLOCK_BITS | ThreadState::LOCKED)
        {
            self.putback_locked(s, tid);
        }
    }

    /// Migrate the current thread to another CPU within its affinity.
    pub fn migrate_thread(&self, cpu: u32) -> Result {
        if self.arch.escalate() {
            return Err(code::EPERM);
        }

        let mut g = self.state.lock_irqsave(self.arch);
        let cur_cpu = self.arch.current_cpu();
        let tid = g.scheds[cur_cpu as usize].curr;

        if g.threads[tid].state.contains(ThreadState::LOCKED) {
            return Err(code::EBUSY);
        }
        if cpu >= self.arch.num_online_cpus() || !g.threads[tid].affinity.isset(cpu) {
            return Err(code::EPERM);
        }
        if cpu == cur_cpu {
            return Ok(());
        }

        trace!("thread migrate: {:?} -> cpu{cpu}", g.threads[tid].name());

        fpu::release_fpu(self.arch, &mut g, tid);

        if g.threads[tid].state.contains(ThreadState::READY) {
            self.dequeue_ready(&mut g, tid);
        }

        self.set_resched(&mut g, cur_cpu);
        g.threads[tid].cpu = cpu;
        let pt = g.threads[tid].ptimer;
        g.timers.set_sched(pt, cpu);

        if self.arch.unlocked_switch() {
            // In flight: the unlocked-switch tail lands the thread on the
            // remote run queue.
            g.threads[tid].state.insert(ThreadState::MIGRATING);
        } else {
            self.putback_locked(&mut g, tid);
        }

        // Restart the execution-time window so per-CPU statistics stay
        // consistent.
        let now = g.timers.jiffies();
        g.threads[tid].stat.exec_start = now;

        self.do_schedule(g);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Control modes.

    /// Alter the control mode bits of a thread. Returns the previous mode.
    pub fn set_thread_mode(
        &self,
        tid: ThreadId,
        clrmask: ThreadState,
        setmask: ThreadState,
    ) -> Result<ThreadState> {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        let cpu = self.arch.current_cpu();
        let curr = g.scheds[cpu as usize].curr;

        let mut setmask = setmask;
        #[cfg(not(feature = "shield"))]
        setmask.remove(ThreadState::SHIELDED);

        let oldmode;
        {
            let t = &mut g.threads[tid];
            oldmode = t.state & ThreadState::MODE_BITS;
            t.state.remove(clrmask & ThreadState::MODE_BITS);
            t.state.insert(setmask & ThreadState::MODE_BITS);

            if curr == tid {
                if !oldmode.contains(ThreadState::LOCKED) {
                    if t.state.contains(ThreadState::LOCKED) {
                        // Actually grab the scheduler lock.
                        t.lock_count = 1;
                    }
                } else if !t.state.contains(ThreadState::LOCKED) {
                    t.lock_count = 0;
                }
            }

            if !oldmode.contains(ThreadState::ROUND_ROBIN)
                && t.state.contains(ThreadState::ROUND_ROBIN)
            {
                t.rrcredit = t.rrperiod;
            }
        }

        #[cfg(feature = "shield")]
        if curr == tid
            && g.threads[tid].state.contains(ThreadState::SHADOW)
            && (clrmask | setmask).contains(ThreadState::SHIELDED)
        {
            if let Some(b) = self.bridge() {
                b.reset_shield();
            }
        }

        Ok(oldmode)
    }

    /// Grab the scheduler lock on behalf of the current thread; nests.
    pub fn lock_sched(&self) {
        let mut g = self.state.lock_irqsave(self.arch);
        let cpu = self.arch.current_cpu();
        let curr = g.scheds[cpu as usize].curr;
        let t = &mut g.threads[curr];
        if t.lock_count == 0 {
            t.state.insert(ThreadState::LOCKED);
        }
        t.lock_count += 1;
    }

    /// Release one nesting level of the scheduler lock; dropping the last
    /// level reschedules.
    pub fn unlock_sched(&self) {
        let mut g = self.state.lock_irqsave(self.arch);
        let cpu = self.arch.current_cpu();
        let curr = g.scheds[cpu as usize].curr;
        debug_assert!(g.threads[curr].lock_count > 0);
        let t = &mut g.threads[curr];
        t.lock_count -= 1;
        if t.lock_count == 0 {
            t.state.remove(ThreadState::LOCKED);
            self.set_resched(&mut g, cpu);
            self.do_schedule(g);
        }
    }

    /// Arm round-robin scheduling for every thread carrying the mode bit.
    pub fn activate_rr(&self, quantum: Ticks) {
        let mut g = self.state.lock_irqsave(self.arch);
        let all = g.threadq.clone();
        for tid in all {
            let Some(t) = g.threads.get_mut(tid) else { continue };
            if t.state.contains(ThreadState::ROUND_ROBIN) {
                t.rrperiod = quantum;
                t.rrcredit = quantum;
            }
        }
    }

    /// Disarm round-robin scheduling pod-wide.
    pub fn deactivate_rr(&self) {
        let mut g = self.state.lock_irqsave(self.arch);
        let all = g.threadq.clone();
        for tid in all {
            let Some(t) = g.threads.get_mut(tid) else { continue };
            if t.state.contains(ThreadState::ROUND_ROBIN) {
                t.rrcredit = INFINITE;
            }
        }
    }

    // ---------------------------------------------------------------
    // Periodic threads.

    /// Program the release point and period of a thread. An infinite
    /// period stops the periodic timer; a period below the scheduling
    /// latency figure is refused.
    pub fn set_thread_periodic(&self, tid: ThreadId, idate: Ticks, period: Ticks) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        let pt = g.threads[tid].ptimer;

        if period == INFINITE {
            if g.timers.running_p(pt) {
                g.timers.stop(pt);
            }
            return Ok(());
        }
        if period < g.latency {
            // Periods shorter than the intrinsic latency cannot hold.
            return Err(code::EINVAL);
        }

        let tcpu = g.threads[tid].cpu;
        g.timers.set_sched(pt, tcpu);

        if idate == INFINITE {
            g.timers.start(pt, period, period, TimerMode::Relative)?;
            return Ok(());
        }

        g.timers.start(pt, idate, period, TimerMode::Realtime)?;
        let interval = g.timers.interval(pt);
        g.timers.pexpect_forward(pt, interval);
        match self.suspend_locked(&mut g, tid, ThreadState::DELAYED, INFINITE, TimerMode::Relative, None)? {
            SuspendOutcome::Schedule => self.do_schedule(g),
            _ => {}
        }
        Ok(())
    }

    /// Wait for the next periodic release point of the current thread.
    /// Returns the count of overruns accumulated while the CPU was away;
    /// a non-zero count means release points were missed. A broken wait
    /// surfaces as EINTR, an unarmed period as EWOULDBLOCK.
    pub fn wait_thread_period(&self) -> Result<Ticks> {
        let mut g = self.state.lock_irqsave(self.arch);
        let cpu = self.arch.current_cpu();
        let tid = g.scheds[cpu as usize].curr;
        let pt = g.threads[tid].ptimer;

        if !g.timers.running_p(pt) {
            return Err(code::EWOULDBLOCK);
        }

        let now = g.timers.jiffies();
        if now < g.timers.pexpect(pt) {
            match self.suspend_locked(&mut g, tid, ThreadState::DELAYED, INFINITE, TimerMode::Relative, None)? {
                SuspendOutcome::Schedule => {
                    self.do_schedule(g);
                    g = self.state.lock_irqsave(self.arch);
                }
                _ => {}
            }
            if !g.threads.contains(tid) {
                return Err(code::EINTR);
            }
            if g.threads[tid].info.contains(ThreadInfo::BROKEN) {
                return Err(code::EINTR);
            }
        }

        let now = g.timers.jiffies();
        let overruns = g.timers.get_overruns(pt, now);
        Ok(overruns)
    }

    // ---------------------------------------------------------------
    // Hook chains.

    /// Install a scheduling-event hook. Chains fire newest-first.
    pub fn add_hook(&self, kind: HookKind, routine: HookFn) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        g.hooks.list_mut(kind).insert(0, routine);
        Ok(())
    }

    /// Remove a previously installed hook; unknown routines are refused.
    pub fn remove_hook(&self, kind: HookKind, routine: HookFn) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        let list = g.hooks.list_mut(kind);
        match list.iter().position(|&h| h == routine) {
            Some(pos) => {
                list.remove(pos);
                Ok(())
            }
            None => Err(code::EINVAL),
        }
    }

    /// Run a hook chain with the callout marker raised on the local slot.
    /// The chain sees a consistent thread snapshot; the scheduler lock is
    /// effectively held throughout.
    pub(crate) fn fire_callouts(&self, s: &mut PodState, kind: HookKind, tid: ThreadId) {
        let cpu = self.arch.current_cpu() as usize;
        s.scheds[cpu].status.insert(SchedStatus::KCOUT);
        let chain = s.hooks.list(kind).clone();
        for hook in chain {
            if let Some(t) = s.threads.get(tid) {
                hook(t);
            }
        }
        s.scheds[cpu].status.remove(SchedStatus::KCOUT);
    }

    // ---------------------------------------------------------------
    // Asynchronous signals.

    /// Post user signals to a thread. The pending set drains through the
    /// thread's ASR at the tail of the next local scheduling pass.
    pub fn post_signals(&self, tid: ThreadId, sigs: u32) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        g.threads[tid].signals |= sigs;
        let tcpu = g.threads[tid].cpu;
        self.set_resched(&mut g, tcpu);
        Ok(())
    }

    /// Install the asynchronous service routine of a thread, along with
    /// the mode override and interrupt mask it runs under.
    pub fn set_thread_asr(
        &self,
        tid: ThreadId,
        asr: Option<Asr>,
        mode: ThreadState,
        imask: usize,
    ) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        let t = &mut g.threads[tid];
        t.asr = asr;
        t.asr_mode = mode & ThreadState::MODE_BITS;
        t.asr_imask = imask;
        Ok(())
    }

    /// Drain pending signals of the local current thread through its ASR.
    /// Runs with the pod lock held at the scheduler tail; the ASR may be
    /// reentered if new signals arrive while it runs.
    pub(crate) fn dispatch_signals_locked(&self, s: &mut PodState, cpu: u32) {
        let tid = s.scheds[cpu as usize].curr;
        let (sigs, asr, asr_imask, oldmode);
        {
            let t = &mut s.threads[tid];
            if t.signals == 0 || t.state.contains(ThreadState::ASR_OFF) {
                return;
            }
            let Some(routine) = t.asr else { return };
            oldmode = t.state & ThreadState::MODE_BITS;
            sigs = t.signals;
            asr_imask = t.asr_imask;
            asr = routine;
            // Clear the pending set first: the ASR can be reentrant.
            t.signals = 0;
            t.state.remove(ThreadState::MODE_BITS);
            let asr_mode = t.asr_mode;
            t.state.insert(asr_mode);
            t.asr_level += 1;
        }

        let saved = self.arch.set_irq_mask(asr_imask);
        asr(sigs);
        self.arch.set_irq_mask(saved);

        let t = &mut s.threads[tid];
        t.asr_level -= 1;
        t.state.remove(ThreadState::MODE_BITS);
        t.state.insert(oldmode);
    }

    // ---------------------------------------------------------------
    // Fault entry.

    /// Default handler for uncontrolled exceptions. Faults on behalf of a
    /// real-time context are contained here; anything else propagates to
    /// the host.
    pub fn trap_fault(&self, info: &FaultInfo) -> bool {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.active() {
            return false;
        }
        let cpu = self.arch.current_cpu();
        let curr = g.scheds[cpu as usize].curr;
        if !self.arch.escalate() && g.threads[curr].state.contains(ThreadState::ROOT) {
            return false;
        }

        if info.fpu_fault {
            if fpu::fault_init_fpu(self.arch, &mut g, curr) {
                return true;
            }
            error!("invalid use of FPU in real-time context at {:#x}", info.pc);
        }

        if !g.threads[curr].tcb.user_task {
            // A kernel thread faulted: freeze it and keep the system up.
            error!(
                "suspending kernel thread {:?} at {:#x} after exception #{}",
                g.threads[curr].name(),
                info.pc,
                info.trap
            );
            match self.suspend_locked(
                &mut g,
                curr,
                ThreadState::SUSPENDED,
                INFINITE,
                TimerMode::Relative,
                None,
            ) {
                Ok(SuspendOutcome::Schedule) => self.do_schedule(g),
                _ => {}
            }
            return true;
        }

        if g.threads[curr].state.contains(ThreadState::SHADOW) {
            if info.page_fault {
                // Not SMP-exact, but a reliable indicator that memory
                // locking went wrong.
                g.threads[curr].stat.pf += 1;
            }
            if let Some(b) = self.bridge() {
                drop(g);
                // Hand the exception to the host by demoting the shadow.
                b.relax(info.notify);
            }
        }
        false
    }

    // ---------------------------------------------------------------
    // Thread prologue.

    /// Run on behalf of a (re)starting thread before its entry point:
    /// settle a pending unlocked switch, reap zombies, re-grab the
    /// scheduler lock, set up the FPU and drain startup signals.
    pub fn welcome_thread(&self) {
        let mut g = self.state.lock_irqsave(self.arch);
        let cpu = self.arch.current_cpu();
        if self.arch.unlocked_switch() {
            self.finish_unlocked_switch(&mut g, cpu);
        }
        self.finalize_zombie(&mut g, cpu);

        let curr = g.scheds[cpu as usize].curr;
        if g.threads[curr].state.contains(ThreadState::LOCKED) && g.threads[curr].lock_count == 0 {
            // Actually grab the scheduler lock.
            g.threads[curr].lock_count = 1;
        }

        fpu::init_fpu(self.arch, &mut g, cpu);

        g.threads[curr].state.remove(ThreadState::RESTARTING);

        if g.threads[curr].signaled() {
            self.dispatch_signals_locked(&mut g, cpu);
        }
    }

    // ---------------------------------------------------------------
    // Synchronization objects.

    /// Create a wait-queue object.
    pub fn create_synch(&self, flags: SynchFlags) -> SynchId {
        let mut g = self.state.lock_irqsave(self.arch);
        g.synchs.create(flags)
    }

    /// Destroy a wait-queue object, flushing every sleeper with the
    /// deletion cause raised.
    pub fn delete_synch(&self, sid: SynchId) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        let sleepers: Vec<ThreadId> = match g.synchs.get(sid) {
            Some(sy) => sy.pendq.clone(),
            None => return Err(code::EINVAL),
        };
        for t in sleepers {
            if let Some(sy) = g.synchs.get_mut(sid) {
                sy.remove_sleeper(t);
            }
            g.threads[t].wchan = None;
            g.threads[t].info.insert(ThreadInfo::SYNCH_GONE);
            self.resume_locked(&mut g, t, ThreadState::PENDING);
        }
        if let Some(owner) = g.synchs.get(sid).and_then(|sy| sy.owner) {
            g.threads[owner].owned.retain(|&x| x != sid);
            if g.threads[owner].state.contains(ThreadState::BOOSTED) {
                self.clear_boost(&mut g, owner);
            }
        }
        g.synchs.remove(sid);
        Ok(())
    }

    /// Pend the current thread on a wait-queue object, optionally bounded
    /// in time. The owner of a priority-inheriting object is boosted to
    /// the sleeper's level first.
    pub fn sleep_on(&self, sid: SynchId, timeout: Ticks, mode: TimerMode) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if g.synchs.get(sid).is_none() {
            return Err(code::EINVAL);
        }
        let cpu = self.arch.current_cpu();
        let tid = g.scheds[cpu as usize].curr;
        self.boost_owner(&mut g, sid, tid);
        self.queue_sleeper(&mut g, sid, tid);
        match self.suspend_locked(&mut g, tid, ThreadState::PENDING, timeout, mode, Some(sid))? {
            SuspendOutcome::Schedule => self.do_schedule(g),
            _ => {}
        }
        Ok(())
    }

    /// Wake the first sleeper, leaving ownership untouched. Never
    /// reschedules.
    pub fn synch_wakeup_one(&self, sid: SynchId) -> Result<Option<ThreadId>> {
        let mut g = self.state.lock_irqsave(self.arch);
        let Some(sy) = g.synchs.get_mut(sid) else {
            return Err(code::EINVAL);
        };
        let woken = sy.pendq.first().copied();
        if let Some(w) = woken {
            sy.remove_sleeper(w);
            g.threads[w].wchan = None;
            g.threads[w].info.insert(ThreadInfo::WOKEN);
            self.resume_locked(&mut g, w, ThreadState::PENDING);
        }
        Ok(woken)
    }

    /// Claim an ownership-tracking object: immediate when free, otherwise
    /// the caller pends and the releaser hands the object over.
    pub fn synch_acquire(&self, sid: SynchId, timeout: Ticks, mode: TimerMode) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if g.synchs.get(sid).is_none() {
            return Err(code::EINVAL);
        }
        let cpu = self.arch.current_cpu();
        let tid = g.scheds[cpu as usize].curr;

        if g.synchs.get(sid).unwrap().owner.is_none() {
            g.synchs.get_mut(sid).unwrap().owner = Some(tid);
            g.threads[tid].owned.push(sid);
            return Ok(());
        }

        self.boost_owner(&mut g, sid, tid);
        self.queue_sleeper(&mut g, sid, tid);
        match self.suspend_locked(&mut g, tid, ThreadState::PENDING, timeout, mode, Some(sid))? {
            SuspendOutcome::Schedule => {
                self.do_schedule(g);
                g = self.state.lock_irqsave(self.arch);
            }
            _ => {}
        }

        // Beyond this point a real port only runs once resumed; the
        // simulated port falls through with the pend still armed and the
        // driver observing the sleeper from outside.
        if g.threads[tid].state.contains(ThreadState::PENDING) {
            return Ok(());
        }
        if g.threads[tid].info.contains(ThreadInfo::BROKEN) {
            return Err(code::EINTR);
        }
        if g.threads[tid].info.contains(ThreadInfo::TIMEDOUT) {
            return Err(code::ETIMEDOUT);
        }
        Ok(())
    }

    /// Release an owned object, waking the next sleeper as the new owner
    /// and dropping any boost the ownership conferred. Never reschedules.
    pub fn synch_release(&self, sid: SynchId) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if g.synchs.get(sid).is_none() {
            return Err(code::EINVAL);
        }
        let cpu = self.arch.current_cpu();
        let tid = g.scheds[cpu as usize].curr;
        if g.synchs.get(sid).unwrap().owner != Some(tid) {
            return Err(code::EPERM);
        }
        self.release_locked(&mut g, sid, tid);
        Ok(())
    }

    pub(crate) fn release_locked(&self, s: &mut PodState, sid: SynchId, owner: ThreadId) {
        s.threads[owner].owned.retain(|&x| x != sid);
        if s.threads[owner].state.contains(ThreadState::BOOSTED) {
            self.clear_boost(s, owner);
        }
        let next = s
            .synchs
            .get(sid)
            .and_then(|sy| sy.pendq.first().copied());
        match next {
            Some(n) => {
                let sy = s.synchs.get_mut(sid).unwrap();
                sy.remove_sleeper(n);
                sy.owner = Some(n);
                s.threads[n].wchan = None;
                s.threads[n].owned.push(sid);
                self.resume_locked(s, n, ThreadState::PENDING);
            }
            None => {
                if let Some(sy) = s.synchs.get_mut(sid) {
                    sy.owner = None;
                }
            }
        }
    }

    /// Release every object the thread still owns, waking the next
    /// claimants in turn.
    pub(crate) fn release_all_ownerships(&self, s: &mut PodState, tid: ThreadId) {
        let owned = s.threads[tid].owned.clone();
        for sid in owned {
            if s.synchs.get(sid).map(|sy| sy.owner) == Some(Some(tid)) {
                self.release_locked(s, sid, tid);
            } else {
                s.threads[tid].owned.retain(|&x| x != sid);
            }
        }
    }

    /// Drop a sleeper from its wait queue and clear the latched channel.
    /// The owner of a priority-inheriting object loses whatever boost the
    /// sleeper's claim conferred.
    pub(crate) fn forget_sleeper(&self, s: &mut PodState, tid: ThreadId) {
        s.threads[tid].state.remove(ThreadState::PENDING);
        let Some(w) = s.threads[tid].wchan.take() else {
            return;
        };
        let owner = match s.synchs.get_mut(w) {
            Some(sy) => {
                sy.remove_sleeper(tid);
                if sy.status.contains(SynchFlags::PIP) {
                    sy.owner
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(o) = owner {
            if s.threads.contains(o) && s.threads[o].state.contains(ThreadState::BOOSTED) {
                self.clear_boost(s, o);
            }
        }
    }

    /// Requeue a sleeper whose effective priority changed, unless the
    /// object opted out of dynamic reordering, then escalate the boost of
    /// the object's owner as needed.
    pub(crate) fn renice_sleeper(&self, s: &mut PodState, tid: ThreadId) {
        let Some(w) = s.threads[tid].wchan else {
            return;
        };
        let prio = s.threads[tid].cprio;
        let (pip, owner) = {
            let PodState {
                threads, synchs, ..
            } = s;
            let Some(sy) = synchs.get_mut(w) else {
                return;
            };
            sy.reorder_sleeper(tid, prio, |id| {
                threads.get(id).map(|t| t.cprio).unwrap_or(PRIO_MIN)
            });
            (sy.status.contains(SynchFlags::PIP), sy.owner)
        };
        if pip {
            if let Some(o) = owner {
                if s.threads.contains(o) && s.threads[o].cprio < prio {
                    s.threads[o].state.insert(ThreadState::BOOSTED);
                    self.renice_cprio(s, o, prio);
                }
            }
        }
    }

    fn queue_sleeper(&self, s: &mut PodState, sid: SynchId, tid: ThreadId) {
        let prio = s.threads[tid].cprio;
        let PodState {
            threads, synchs, ..
        } = s;
        if let Some(sy) = synchs.get_mut(sid) {
            sy.insert_sleeper(tid, prio, |id| {
                threads.get(id).map(|t| t.cprio).unwrap_or(PRIO_MIN)
            });
        }
    }

    fn boost_owner(&self, s: &mut PodState, sid: SynchId, claimant: ThreadId) {
        let (pip, owner) = match s.synchs.get(sid) {
            Some(sy) => (sy.status.contains(SynchFlags::PIP), sy.owner),
            None => return,
        };
        if !pip {
            return;
        }
        let prio = s.threads[claimant].cprio;
        if let Some(o) = owner {
            if s.threads.contains(o) && s.threads[o].cprio < prio {
                s.threads[o].state.insert(ThreadState::BOOSTED);
                self.renice_cprio(s, o, prio);
            }
        }
    }

    /// Recompute the effective priority of a formerly boosted owner from
    /// the objects it still holds.
    pub(crate) fn clear_boost(&self, s: &mut PodState, tid: ThreadId) {
        let owned = s.threads[tid].owned.clone();
        let mut wprio: Option<Prio> = None;
        {
            let PodState {
                threads, synchs, ..
            } = s;
            for sid in owned {
                let Some(sy) = synchs.get(sid) else { continue };
                if !sy.status.contains(SynchFlags::PIP) {
                    continue;
                }
                if let Some(p) = sy.front_prio(|id| {
                    threads.get(id).map(|t| t.cprio).unwrap_or(PRIO_MIN)
                }) {
                    wprio = Some(wprio.map_or(p, |w| w.max(p)));
                }
            }
        }
        let bprio = s.threads[tid].bprio;
        let target = match wprio {
            Some(p) if p > bprio => p,
            _ => {
                s.threads[tid].state.remove(ThreadState::BOOSTED);
                bprio
            }
        };
        if s.threads[tid].cprio != target {
            self.renice_cprio(s, tid, target);
        }
    }

    // ---------------------------------------------------------------
    // Host-side plumbing.

    /// Raise the host-kick condition on a thread and break any wait it is
    /// in. Invoked by the bridge when the twin receives a host signal.
    pub fn kick_thread(&self, tid: ThreadId) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        g.threads[tid].info.insert(ThreadInfo::KICKED);
        self.unblock_locked(&mut g, tid);
        Ok(())
    }

    /// Mark whether the thread has a live host mate attached.
    pub fn set_thread_user_task(&self, tid: ThreadId, mapped: bool) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if !g.threads.contains(tid) {
            return Err(code::EINVAL);
        }
        g.threads[tid].tcb.user_task = mapped;
        Ok(())
    }

    /// Request a cross-domain priority check on `cpu`, served by the next
    /// reschedule IPI.
    pub fn request_rpi_check(&self, cpu: u32) -> Result {
        let mut g = self.state.lock_irqsave(self.arch);
        if cpu as usize >= g.scheds.len() {
            return Err(code::EINVAL);
        }
        g.scheds[cpu as usize].status.insert(SchedStatus::RPICK);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Run-queue plumbing shared with the scheduler core.

    /// Flag `target_cpu` for rescheduling; the bit is collected by the
    /// next scheduling pass on this CPU, which sends IPIs for any remote
    /// bits.
    pub(crate) fn set_resched(&self, s: &mut PodState, target_cpu: u32) {
        let cur = self.arch.current_cpu();
        s.scheds[cur as usize].resched.set(target_cpu);
    }

    pub(crate) fn enqueue_ready(&self, s: &mut PodState, tid: ThreadId) {
        debug_assert!(!s.threads[tid].state.contains(ThreadState::READY));
        let (class, prio, cpu) = {
            let t = &s.threads[tid];
            (t.sched_class, t.cprio, t.cpu)
        };
        s.scheds[cpu as usize].rq.enqueue(class, prio, tid);
        let t = &mut s.threads[tid];
        t.rq_prio = prio;
        t.state.insert(ThreadState::READY);
    }

    pub(crate) fn requeue_ready(&self, s: &mut PodState, tid: ThreadId) {
        debug_assert!(!s.threads[tid].state.contains(ThreadState::READY));
        let (class, prio, cpu) = {
            let t = &s.threads[tid];
            (t.sched_class, t.cprio, t.cpu)
        };
        s.scheds[cpu as usize].rq.requeue(class, prio, tid);
        let t = &mut s.threads[tid];
        t.rq_prio = prio;
        t.state.insert(ThreadState::READY);
    }

    pub(crate) fn dequeue_ready(&self, s: &mut PodState, tid: ThreadId) {
        debug_assert!(s.threads[tid].state.contains(ThreadState::READY));
        let (class, prio, cpu) = {
            let t = &s.threads[tid];
            (t.sched_class, t.rq_prio, t.cpu)
        };
        s.scheds[cpu as usize].rq.dequeue(class, prio, tid);
        s.threads[tid].state.remove(ThreadState::READY);
    }

    /// Dequeue-then-enqueue at the tail of the thread's priority band,
    /// producing the round-robin effect, and flag its CPU.
    pub(crate) fn putback_locked(&self, s: &mut PodState, tid: ThreadId) {
        if s.threads[tid].state.contains(ThreadState::READY) {
            self.dequeue_ready(s, tid);
        }
        self.enqueue_ready(s, tid);
        let tcpu = s.threads[tid].cpu;
        self.set_resched(s, tcpu);
    }

    // ---------------------------------------------------------------
    // Introspection.

    pub fn active(&self) -> bool {
        self.state.lock_irqsave(self.arch).active()
    }

    pub fn fatal_p(&self) -> bool {
        self.state
            .lock_irqsave(self.arch)
            .status
            .contains(PodFlags::FATAL)
    }

    pub fn jiffies(&self) -> Ticks {
        self.state.lock_irqsave(self.arch).timers.jiffies()
    }

    pub fn set_wallclock_offset(&self, off: STicks) {
        self.state
            .lock_irqsave(self.arch)
            .timers
            .set_wallclock_offset(off);
    }

    /// Tune the scheduling-latency figure periodic requests are validated
    /// against.
    pub fn set_latency(&self, latency: Ticks) {
        self.state.lock_irqsave(self.arch).latency = latency;
    }

    pub fn current_thread(&self) -> ThreadId {
        let g = self.state.lock_irqsave(self.arch);
        g.scheds[self.arch.current_cpu() as usize].curr
    }

    pub fn root_thread(&self, cpu: u32) -> ThreadId {
        let g = self.state.lock_irqsave(self.arch);
        g.scheds[cpu as usize].root
    }

    pub fn thread_state(&self, tid: ThreadId) -> Result<ThreadState> {
        let g = self.state.lock_irqsave(self.arch);
        g.threads.get(tid).map(|t| t.state).ok_or(code::EINVAL)
    }

    pub fn thread_info(&self, tid: ThreadId) -> Result<ThreadInfo> {
        let g = self.state.lock_irqsave(self.arch);
        g.threads.get(tid).map(|t| t.info).ok_or(code::EINVAL)
    }

    /// (current, base, initial) priorities.
    pub fn thread_priorities(&self, tid: ThreadId) -> Result<(Prio, Prio, Prio)> {
        let g = self.state.lock_irqsave(self.arch);
        g.threads
            .get(tid)
            .map(|t| (t.cprio, t.bprio, t.iprio))
            .ok_or(code::EINVAL)
    }

    pub fn thread_cpu(&self, tid: ThreadId) -> Result<u32> {
        let g = self.state.lock_irqsave(self.arch);
        g.threads.get(tid).map(|t| t.cpu).ok_or(code::EINVAL)
    }

    pub fn thread_name(&self, tid: ThreadId) -> Result<String> {
        let g = self.state.lock_irqsave(self.arch);
        g.threads
            .get(tid)
            .map(|t| t.name.clone())
            .ok_or(code::EINVAL)
    }

    pub fn thread_stats(&self, tid: ThreadId) -> Result<crate::thread::ThreadStats> {
        let g = self.state.lock_irqsave(self.arch);
        g.threads.get(tid).map(|t| t.stat).ok_or(code::EINVAL)
    }

    pub fn thread_wchan(&self, tid: ThreadId) -> Result<Option<SynchId>> {
        let g = self.state.lock_irqsave(self.arch);
        g.threads.get(tid).map(|t| t.wchan).ok_or(code::EINVAL)
    }

    /// Snapshot of one CPU's ready queue in pick order.
    pub fn ready_threads(&self, cpu: u32) -> Vec<ThreadId> {
        let g = self.state.lock_irqsave(self.arch);
        g.scheds[cpu as usize].rq.iter_ordered()
    }

    /// Revision counter of the global thread list.
    pub fn threadq_rev(&self) -> u32 {
        self.state.lock_irqsave(self.arch).threadq_rev
    }
}
