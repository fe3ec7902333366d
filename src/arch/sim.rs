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

//! Deterministic simulated port. Context switches are recorded instead of
//! performed, interrupts are modeled as per-CPU nesting counters and IPIs
//! accumulate until the driver delivers them. Hosted tests run the whole
//! executive against this port.

use super::{ArchOps, ArchTcb, IpiHandler, ThreadEntry};
use crate::{
    error::{code, Result},
    types::{CpuMask, Ticks},
};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

const MAX_CPUS: usize = 8;

/// One recorded context switch: outgoing FPU-area id (none for a discarded
/// context) and the incoming one.
pub type SwitchRecord = (Option<u64>, u64);

pub struct SimArch {
    ncpus: u32,
    current_cpu: AtomicU32,
    irq_depth: [AtomicUsize; MAX_CPUS],
    escalate: AtomicBool,
    unlocked_switch: AtomicBool,
    switches: Mutex<Vec<SwitchRecord>>,
    ipis: Mutex<Vec<CpuMask>>,
    ipi_hook: Mutex<Option<IpiHandler>>,
    timers_running: Mutex<Vec<u32>>,
    /// Outcome of the next `start_timer` calls: `Ok(n)` encoded as n,
    /// `u64::MAX` meaning refuse with ENODEV.
    host_tick_mode: AtomicU64,
    relayed_ticks: AtomicUsize,
    fpu_saves: Mutex<Vec<u64>>,
    fpu_restores: Mutex<Vec<u64>>,
    fpu_enables: Mutex<Vec<u64>>,
    irq_mask: AtomicUsize,
    next_region: AtomicUsize,
}

impl SimArch {
    pub fn new(ncpus: u32) -> Self {
        assert!(ncpus as usize <= MAX_CPUS && ncpus > 0);
        Self {
            ncpus,
            current_cpu: AtomicU32::new(0),
            irq_depth: Default::default(),
            escalate: AtomicBool::new(false),
            unlocked_switch: AtomicBool::new(false),
            switches: Mutex::new(Vec::new()),
            ipis: Mutex::new(Vec::new()),
            ipi_hook: Mutex::new(None),
            timers_running: Mutex::new(Vec::new()),
            host_tick_mode: AtomicU64::new(0),
            relayed_ticks: AtomicUsize::new(0),
            fpu_saves: Mutex::new(Vec::new()),
            fpu_restores: Mutex::new(Vec::new()),
            fpu_enables: Mutex::new(Vec::new()),
            irq_mask: AtomicUsize::new(0),
            next_region: AtomicUsize::new(0x1000),
        }
    }

    /// Leak an instance so it can back a `&'static dyn ArchOps`.
    pub fn leak(ncpus: u32) -> &'static Self {
        alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new(ncpus)))
    }

    pub fn set_current_cpu(&self, cpu: u32) {
        assert!(cpu < self.ncpus);
        self.current_cpu.store(cpu, Ordering::SeqCst);
    }

    pub fn set_escalate(&self, on: bool) {
        self.escalate.store(on, Ordering::SeqCst);
    }

    pub fn set_unlocked_switch(&self, on: bool) {
        self.unlocked_switch.store(on, Ordering::SeqCst);
    }

    /// Program the result of subsequent `start_timer` calls.
    pub fn set_host_tick_period(&self, period: Ticks) {
        self.host_tick_mode.store(period, Ordering::SeqCst);
    }

    pub fn refuse_timer(&self) {
        self.host_tick_mode.store(u64::MAX, Ordering::SeqCst);
    }

    pub fn irqs_off(&self, cpu: u32) -> bool {
        self.irq_depth[cpu as usize].load(Ordering::SeqCst) > 0
    }

    pub fn switch_count(&self) -> usize {
        self.switches.lock().len()
    }

    pub fn switches(&self) -> Vec<SwitchRecord> {
        self.switches.lock().clone()
    }

    pub fn take_ipis(&self) -> Vec<CpuMask> {
        core::mem::take(&mut *self.ipis.lock())
    }

    pub fn running_timers(&self) -> Vec<u32> {
        self.timers_running.lock().clone()
    }

    pub fn relayed_ticks(&self) -> usize {
        self.relayed_ticks.load(Ordering::SeqCst)
    }

    pub fn fpu_saves(&self) -> Vec<u64> {
        self.fpu_saves.lock().clone()
    }

    pub fn fpu_restores(&self) -> Vec<u64> {
        self.fpu_restores.lock().clone()
    }

    pub fn fpu_enables(&self) -> Vec<u64> {
        self.fpu_enables.lock().clone()
    }

    pub fn ipi_hooked(&self) -> bool {
        self.ipi_hook.lock().is_some()
    }
}

impl ArchOps for SimArch {
    fn num_online_cpus(&self) -> u32 {
        self.ncpus
    }

    fn current_cpu(&self) -> u32 {
        self.current_cpu.load(Ordering::SeqCst)
    }

    fn cpu_online_map(&self) -> CpuMask {
        CpuMask::from_bits((1u32 << self.ncpus) - 1)
    }

    fn local_irq_save(&self) -> usize {
        let cpu = self.current_cpu() as usize;
        self.irq_depth[cpu].fetch_add(1, Ordering::SeqCst)
    }

    fn local_irq_restore(&self, _flags: usize) {
        let cpu = self.current_cpu() as usize;
        let prev = self.irq_depth[cpu].fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    fn escalate(&self) -> bool {
        self.escalate.load(Ordering::SeqCst)
    }

    fn set_irq_mask(&self, mask: usize) -> usize {
        self.irq_mask.swap(mask, Ordering::SeqCst)
    }

    fn hook_ipi(&self, handler: IpiHandler) {
        *self.ipi_hook.lock() = Some(handler);
    }

    fn send_ipi(&self, mask: CpuMask) {
        self.ipis.lock().push(mask);
    }

    fn init_thread(
        &self,
        tcb: &mut ArchTcb,
        entry: Option<ThreadEntry>,
        cookie: usize,
        imask: usize,
        _name: &str,
    ) {
        tcb.entry = entry;
        tcb.cookie = cookie;
        tcb.imask = imask;
    }

    fn switch_to(&self, prev: Option<&mut ArchTcb>, next: &mut ArchTcb) {
        self.switches
            .lock()
            .push((prev.map(|p| p.fpu_area), next.fpu_area));
    }

    fn finalize_no_switch(&self, tcb: &mut ArchTcb) {
        tcb.entry = None;
    }

    fn unlocked_switch(&self) -> bool {
        self.unlocked_switch.load(Ordering::SeqCst)
    }

    fn save_fpu(&self, tcb: &mut ArchTcb) {
        self.fpu_saves.lock().push(tcb.fpu_area);
    }

    fn restore_fpu(&self, tcb: &mut ArchTcb) {
        self.fpu_restores.lock().push(tcb.fpu_area);
    }

    fn enable_fpu(&self, tcb: &mut ArchTcb) {
        self.fpu_enables.lock().push(tcb.fpu_area);
    }

    fn start_timer(&self, cpu: u32) -> Result<Ticks> {
        match self.host_tick_mode.load(Ordering::SeqCst) {
            u64::MAX => Err(code::ENODEV),
            period => {
                self.timers_running.lock().push(cpu);
                Ok(period)
            }
        }
    }

    fn stop_timer(&self, cpu: u32) {
        self.timers_running.lock().retain(|&c| c != cpu);
    }

    fn relay_host_tick(&self, _cpu: u32) {
        self.relayed_ticks.fetch_add(1, Ordering::SeqCst);
    }

    fn alloc_host_mem(&self, size: usize) -> Result<usize> {
        Ok(self.next_region.fetch_add(size.max(1), Ordering::SeqCst))
    }

    fn free_host_mem(&self, _base: usize, _size: usize) {}

    fn alloc_stack_mem(&self, size: usize) -> Result<usize> {
        Ok(self.next_region.fetch_add(size.max(1), Ordering::SeqCst))
    }

    fn free_stack_mem(&self, _base: usize, _size: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irq_nesting() {
        let arch = SimArch::new(2);
        let f0 = arch.local_irq_save();
        let f1 = arch.local_irq_save();
        assert!(arch.irqs_off(0));
        arch.local_irq_restore(f1);
        assert!(arch.irqs_off(0));
        arch.local_irq_restore(f0);
        assert!(!arch.irqs_off(0));
    }

    #[test]
    fn timer_refusal() {
        let arch = SimArch::new(1);
        arch.refuse_timer();
        assert_eq!(arch.start_timer(0), Err(code::ENODEV));
        arch.set_host_tick_period(4);
        assert_eq!(arch.start_timer(0), Ok(4));
        assert_eq!(arch.running_timers(), alloc::vec![0]);
        arch.stop_timer(0);
        assert!(arch.running_timers().is_empty());
    }
}
