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

#![allow(dead_code)]

use rtpod::{
    arch::sim::SimArch,
    pod::Pod,
    thread::{ThreadId, ThreadState},
    types::{CpuMask, Prio},
    SchedClass,
};

/// Pod running against a fresh simulated architecture.
pub fn pod_fixture(ncpus: u32) -> (Pod, &'static SimArch) {
    let arch = SimArch::leak(ncpus);
    let pod = Pod::new(arch);
    pod.init().expect("pod init");
    (pod, arch)
}

pub fn spawn_with(
    pod: &Pod,
    name: &str,
    prio: Prio,
    flags: ThreadState,
    mode: ThreadState,
    affinity: CpuMask,
) -> ThreadId {
    let t = pod
        .init_thread(name, prio, flags, 0, SchedClass::Rt)
        .expect("init_thread");
    pod.start_thread(t, mode, 0, affinity, None, 0)
        .expect("start_thread");
    t
}

/// Kernel thread started on any CPU with default mode.
pub fn spawn(pod: &Pod, name: &str, prio: Prio) -> ThreadId {
    spawn_with(
        pod,
        name,
        prio,
        ThreadState::empty(),
        ThreadState::empty(),
        CpuMask::ALL,
    )
}

pub fn ticks(pod: &Pod, n: usize) {
    for _ in 0..n {
        pod.clock_interrupt();
    }
}
