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

//! Shadow bridge interactions: cross-domain starts, kicks, forced primary
//! migration, priority propagation, asynchronous kills, the relax
//! epilogue and the fault path.

mod common;

use common::{pod_fixture, spawn};
use rtpod::{
    arch::{sim::SimArch, FaultInfo},
    pod::Pod,
    shadow::recorder::{Event, RecordingBridge},
    thread::{Thread, ThreadId},
    types::{CpuMask, INFINITE},
    SchedClass, ThreadInfo, ThreadState, TimerMode,
};
use std::sync::Mutex;

fn shadow_fixture() -> (Pod, &'static SimArch, &'static RecordingBridge) {
    let (pod, arch) = pod_fixture(1);
    let bridge = RecordingBridge::leak();
    pod.install_bridge(bridge);
    (pod, arch, bridge)
}

/// Create a shadow thread, hand it to the bridge, then simulate the
/// host-side wakeup mapping it into primary mode.
fn spawn_shadow(pod: &Pod, name: &str, prio: i32) -> ThreadId {
    let t = pod
        .init_thread(name, prio, ThreadState::SHADOW, 0, SchedClass::Rt)
        .unwrap();
    pod.start_thread(t, ThreadState::empty(), 0, CpuMask::ALL, None, 0)
        .unwrap();
    pod.set_thread_user_task(t, true).unwrap();
    pod.resume_thread(t, ThreadState::DORMANT).unwrap();
    pod.schedule();
    t
}

#[test]
fn shadow_start_goes_through_the_bridge() {
    let (pod, _arch, bridge) = shadow_fixture();
    let t = pod
        .init_thread("shadowed", 30, ThreadState::SHADOW, 0, SchedClass::Rt)
        .unwrap();
    pod.start_thread(t, ThreadState::empty(), 0, CpuMask::ALL, None, 0)
        .unwrap();

    assert_eq!(bridge.events(), vec![Event::Start(t)]);
    // The executive did not wake the thread itself.
    assert!(pod.thread_state(t).unwrap().contains(ThreadState::DORMANT));
}

#[test]
fn kicked_shadow_refuses_to_suspend() {
    let (pod, _arch, _bridge) = shadow_fixture();
    let t = spawn_shadow(&pod, "kicked", 30);
    assert_eq!(pod.current_thread(), t);

    pod.kick_thread(t).unwrap();
    pod.suspend_thread(t, ThreadState::SUSPENDED, INFINITE, TimerMode::Relative, None)
        .unwrap();

    let st = pod.thread_state(t).unwrap();
    assert!(!st.contains(ThreadState::SUSPENDED));
    let info = pod.thread_info(t).unwrap();
    assert!(info.contains(ThreadInfo::BROKEN));
    assert!(!info.contains(ThreadInfo::TIMEDOUT));
}

#[test]
fn suspending_relaxed_shadow_forces_primary_mode() {
    let (pod, _arch, bridge) = shadow_fixture();
    let t = spawn_shadow(&pod, "relaxed", 30);

    // Demote to the host domain.
    pod.suspend_thread(t, ThreadState::RELAXED, INFINITE, TimerMode::Relative, None)
        .unwrap();
    assert_eq!(pod.current_thread(), pod.root_thread(0));
    bridge.take_events();

    pod.suspend_thread(t, ThreadState::SUSPENDED, INFINITE, TimerMode::Relative, None)
        .unwrap();
    assert_eq!(bridge.take_events(), vec![Event::Suspend(t)]);
}

#[test]
fn renice_propagates_to_the_host_twin() {
    let (pod, _arch, bridge) = shadow_fixture();
    let t = spawn_shadow(&pod, "propagated", 30);

    // In primary mode the change is only flagged for the next relax.
    pod.renice_thread(t, 40).unwrap();
    assert!(pod.thread_info(t).unwrap().contains(ThreadInfo::PRIO_SET));
    assert!(!bridge.events().contains(&Event::Renice(t, 40)));

    // Relaxed, the bridge carries it over immediately.
    pod.suspend_thread(t, ThreadState::RELAXED, INFINITE, TimerMode::Relative, None)
        .unwrap();
    bridge.take_events();
    pod.renice_thread(t, 50).unwrap();
    assert!(bridge.take_events().contains(&Event::Renice(t, 50)));
}

#[test]
fn deleting_mapped_shadow_signals_the_twin() {
    let (pod, _arch, bridge) = shadow_fixture();
    let t = spawn_shadow(&pod, "killed", 30);

    // Drop back to the root context so the caller is kernel-based.
    pod.suspend_thread(t, ThreadState::RELAXED, INFINITE, TimerMode::Relative, None)
        .unwrap();
    bridge.take_events();

    pod.delete_thread(t).unwrap();
    assert_eq!(
        bridge.take_events(),
        vec![Event::SendSig(t, rtpod::shadow::SIGKILL)]
    );
    // The twin exits on its own; the descriptor survives meanwhile.
    assert!(pod.thread_state(t).is_ok());
}

static RELAX_SWITCH_LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn relax_switch_hook(t: &Thread) {
    RELAX_SWITCH_LOG.lock().unwrap().push(t.name().to_string());
}

#[test]
fn relax_epilogue_skips_the_normal_switch_tail() {
    let (pod, _arch, bridge) = shadow_fixture();
    let t = spawn_shadow(&pod, "epilogued", 30);

    RELAX_SWITCH_LOG.lock().unwrap().clear();
    pod.add_hook(rtpod::HookKind::Switch, relax_switch_hook)
        .unwrap();

    // Relaxing switches to the root thread; being the epilogue of the
    // host scheduler, the switch hooks must not fire.
    pod.suspend_thread(t, ThreadState::RELAXED, INFINITE, TimerMode::Relative, None)
        .unwrap();
    assert_eq!(pod.current_thread(), pod.root_thread(0));
    assert!(RELAX_SWITCH_LOG.lock().unwrap().is_empty());

    // Harden back to primary mode: the normal tail applies again.
    pod.resume_thread(t, ThreadState::RELAXED).unwrap();
    pod.schedule();
    assert_eq!(pod.current_thread(), t);
    assert_eq!(RELAX_SWITCH_LOG.lock().unwrap().len(), 1);

    // A relax whose twin lost its shadow hook reaps the mate.
    bridge.set_unmapped(true);
    bridge.take_events();
    pod.suspend_thread(t, ThreadState::RELAXED, INFINITE, TimerMode::Relative, None)
        .unwrap();
    assert!(bridge.take_events().contains(&Event::Exit));

    pod.remove_hook(rtpod::HookKind::Switch, relax_switch_hook)
        .unwrap();
}

#[test]
fn fault_on_root_is_not_handled() {
    let (pod, _arch, _bridge) = shadow_fixture();
    assert!(!pod.trap_fault(&FaultInfo::default()));
}

#[test]
fn fault_on_kernel_thread_suspends_it() {
    let (pod, _arch, _bridge) = shadow_fixture();
    let t = spawn(&pod, "faulty", 30);
    assert_eq!(pod.current_thread(), t);

    let info = FaultInfo {
        trap: 14,
        pc: 0xdead,
        ..FaultInfo::default()
    };
    assert!(pod.trap_fault(&info));
    assert!(pod
        .thread_state(t)
        .unwrap()
        .contains(ThreadState::SUSPENDED));
    assert_eq!(pod.current_thread(), pod.root_thread(0));
}

#[test]
fn fault_on_shadow_relaxes_to_the_host() {
    let (pod, _arch, bridge) = shadow_fixture();
    let t = spawn_shadow(&pod, "pf_shadow", 30);
    bridge.take_events();

    let info = FaultInfo {
        trap: 14,
        pc: 0xbad,
        from_user: true,
        page_fault: true,
        notify: true,
        ..FaultInfo::default()
    };
    assert!(!pod.trap_fault(&info));
    assert_eq!(pod.thread_stats(t).unwrap().pf, 1);
    assert!(bridge.take_events().contains(&Event::Relax(true)));
}

#[cfg(feature = "fpu")]
#[test]
fn first_fpu_use_of_a_shadow_is_handled() {
    let (pod, _arch, _bridge) = shadow_fixture();
    let t = spawn_shadow(&pod, "fpu_shadow", 30);
    assert_eq!(pod.current_thread(), t);

    let info = FaultInfo {
        fpu_fault: true,
        ..FaultInfo::default()
    };
    assert!(pod.trap_fault(&info));
    // The context is initialized once; the second trap is a real fault.
    assert!(!pod.trap_fault(&info));
}

#[test]
fn rpi_check_served_by_the_reschedule_ipi() {
    let (pod, _arch, bridge) = shadow_fixture();
    pod.request_rpi_check(0).unwrap();
    bridge.take_events();
    pod.schedule_handler();
    assert!(bridge.take_events().contains(&Event::RpiCheck));
}
