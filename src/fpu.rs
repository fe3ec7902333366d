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

//! Lazy FPU arbitration. Each CPU remembers the thread whose FPU state is
//! live in the hardware registers; the state moves only when a different
//! context actually needs the unit.

cfg_if::cfg_if! {
    if #[cfg(feature = "fpu")] {
        use crate::{arch::ArchOps, pod::PodState, thread::{ThreadId, ThreadState}};

        /// Engage the incoming thread's FPU context after a switch: enable
        /// only when the holder's state is already live, otherwise save the
        /// outgoing holder and restore ours.
        pub(crate) fn switch_fpu(arch: &dyn ArchOps, s: &mut PodState, cpu: u32) {
            let curr = s.scheds[cpu as usize].curr;
            if !s.threads[curr].state.contains(ThreadState::FPU) {
                return;
            }
            let holder = s.scheds[cpu as usize].fpuholder;
            if holder == Some(curr) {
                arch.enable_fpu(&mut s.threads[curr].tcb);
                return;
            }
            let curr_area = s.threads[curr].tcb.fpu_area;
            let shared_area = holder
                .and_then(|h| s.threads.get(h))
                .map(|t| t.tcb.fpu_area == curr_area)
                .unwrap_or(false);
            if shared_area {
                arch.enable_fpu(&mut s.threads[curr].tcb);
            } else {
                if let Some(h) = holder {
                    if let Some(ht) = s.threads.get_mut(h) {
                        arch.save_fpu(&mut ht.tcb);
                    }
                }
                arch.restore_fpu(&mut s.threads[curr].tcb);
            }
            s.scheds[cpu as usize].fpuholder = Some(curr);
        }

        /// First switch into a newly created thread: there was no schedule
        /// epilogue for it, so set up its FPU context here.
        pub(crate) fn init_fpu(arch: &dyn ArchOps, s: &mut PodState, cpu: u32) {
            let curr = s.scheds[cpu as usize].curr;
            if !s.threads[curr].state.contains(ThreadState::FPU) {
                return;
            }
            let curr_area = s.threads[curr].tcb.fpu_area;
            if let Some(h) = s.scheds[cpu as usize].fpuholder {
                let distinct = s
                    .threads
                    .get(h)
                    .map(|t| t.tcb.fpu_area != curr_area)
                    .unwrap_or(false);
                if distinct {
                    if let Some(ht) = s.threads.get_mut(h) {
                        arch.save_fpu(&mut ht.tcb);
                    }
                }
            }
            arch.init_fpu(&mut s.threads[curr].tcb);
            s.scheds[cpu as usize].fpuholder = Some(curr);
        }

        /// Drop the holder back-reference of a thread leaving the system.
        pub(crate) fn giveup_fpu(s: &mut PodState, t: ThreadId) {
            let cpu = s.threads[t].cpu as usize;
            if s.scheds[cpu].fpuholder == Some(t) {
                s.scheds[cpu].fpuholder = None;
            }
        }

        /// Force-save the FPU of a migrating thread so the holder pointer
        /// never dangles into another CPU's backup area.
        pub(crate) fn release_fpu(arch: &dyn ArchOps, s: &mut PodState, t: ThreadId) {
            if !s.threads[t].state.contains(ThreadState::FPU) {
                return;
            }
            arch.save_fpu(&mut s.threads[t].tcb);
            let cpu = s.threads[t].cpu as usize;
            s.scheds[cpu].fpuholder = None;
        }

        /// First FPU use trapped on a shadow: perform the deferred context
        /// init and report the fault handled.
        pub(crate) fn fault_init_fpu(arch: &dyn ArchOps, s: &mut PodState, t: ThreadId) -> bool {
            let th = &s.threads[t];
            if th.state.contains(ThreadState::SHADOW) && !th.tcb.fpu_inited {
                arch.init_fpu(&mut s.threads[t].tcb);
                return true;
            }
            false
        }
    } else {
        use crate::{arch::ArchOps, pod::PodState, thread::ThreadId};

        pub(crate) fn switch_fpu(_arch: &dyn ArchOps, _s: &mut PodState, _cpu: u32) {}
        pub(crate) fn init_fpu(_arch: &dyn ArchOps, _s: &mut PodState, _cpu: u32) {}
        pub(crate) fn giveup_fpu(_s: &mut PodState, _t: ThreadId) {}
        pub(crate) fn release_fpu(_arch: &dyn ArchOps, _s: &mut PodState, _t: ThreadId) {}
        pub(crate) fn fault_init_fpu(_arch: &dyn ArchOps, _s: &mut PodState, _t: ThreadId) -> bool {
            false
        }
    }
}
