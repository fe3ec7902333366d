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

//! Architecture contract consumed by the executive. A port implements
//! [`ArchOps`]; the core never touches hardware directly.

use crate::{
    error::Result,
    types::{CpuMask, Ticks},
};

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "sim"))] {
        pub mod sim;
    }
}

/// Body routine of a kernel thread. The opaque cookie supplied at start
/// time is the sole argument.
pub type ThreadEntry = fn(usize);

/// Handler the pod installs for reschedule IPIs.
pub type IpiHandler = fn();

/// Portable thread control block. The executive treats the contents as
/// opaque except for identity; the port fills and interprets them.
#[derive(Debug, Default)]
pub struct ArchTcb {
    pub entry: Option<ThreadEntry>,
    pub cookie: usize,
    pub imask: usize,
    pub stack_size: usize,
    /// Identity of the FPU backup area this context saves into. Two
    /// contexts sharing an area (a shadow and its host mate) compare equal.
    pub fpu_area: u64,
    pub fpu_inited: bool,
    /// Set when a host-side mate is attached to this context (mapped
    /// shadow threads only).
    pub user_task: bool,
}

/// Fault descriptor handed to the trap entry by the port.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultInfo {
    pub trap: u32,
    pub pc: usize,
    pub fpu_fault: bool,
    pub from_user: bool,
    pub page_fault: bool,
    /// Whether the host should be notified (debug traps are silent).
    pub notify: bool,
}

pub trait ArchOps: Send + Sync {
    // CPU topology.
    fn num_online_cpus(&self) -> u32;
    fn current_cpu(&self) -> u32;
    fn cpu_online_map(&self) -> CpuMask;

    // Interrupt control on the local CPU.
    fn local_irq_save(&self) -> usize;
    fn local_irq_restore(&self, flags: usize);

    /// Probe the calling context. Returns true when the caller is not at
    /// base level (interrupt or callout), in which case rescheduling is
    /// deferred to the innermost epilogue.
    fn escalate(&self) -> bool;

    fn memory_barrier(&self) {}

    /// Temporarily override the interrupt mask, returning the previous one.
    fn set_irq_mask(&self, _mask: usize) -> usize {
        0
    }

    // Inter-processor reschedule requests.
    fn hook_ipi(&self, handler: IpiHandler);
    fn send_ipi(&self, mask: CpuMask);

    // Context management.
    fn init_thread(
        &self,
        tcb: &mut ArchTcb,
        entry: Option<ThreadEntry>,
        cookie: usize,
        imask: usize,
        name: &str,
    );

    /// Perform the CPU-level switch. `prev` is absent when the outgoing
    /// context is discarded (a thread restarting over itself).
    fn switch_to(&self, prev: Option<&mut ArchTcb>, next: &mut ArchTcb);

    fn finalize_no_switch(&self, tcb: &mut ArchTcb);

    /// True when this port performs the context switch with the pod lock
    /// released and a switch-lock bit set on the outgoing slot.
    fn unlocked_switch(&self) -> bool {
        false
    }

    fn enter_root(&self, _tcb: &mut ArchTcb) {}
    fn leave_root(&self, _tcb: &mut ArchTcb) {}

    // Lazy FPU management.
    fn save_fpu(&self, _tcb: &mut ArchTcb) {}
    fn restore_fpu(&self, _tcb: &mut ArchTcb) {}
    fn enable_fpu(&self, _tcb: &mut ArchTcb) {}
    fn init_fpu(&self, tcb: &mut ArchTcb) {
        tcb.fpu_inited = true;
    }

    // Clock chip control.
    /// Attach the clock interrupt on `cpu`. `Ok(0)` means host ticks are
    /// delivered by the hardware; a positive value asks the caller to
    /// emulate the host tick with that period.
    fn start_timer(&self, cpu: u32) -> Result<Ticks>;
    fn stop_timer(&self, cpu: u32);
    fn relay_host_tick(&self, _cpu: u32) {}

    // Memory carving for the pod's heaps.
    fn alloc_host_mem(&self, size: usize) -> Result<usize>;
    fn free_host_mem(&self, base: usize, size: usize);
    fn alloc_stack_mem(&self, size: usize) -> Result<usize>;
    fn free_stack_mem(&self, base: usize, size: usize);
}
