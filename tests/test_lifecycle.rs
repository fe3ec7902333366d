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

//! Thread lifecycle, hooks, pod bootstrap and the periodic machinery.

mod common;

use common::{pod_fixture, spawn, spawn_with, ticks};
use rtpod::{
    arch::sim::SimArch,
    code,
    pod::Pod,
    thread::Thread,
    types::{CpuMask, INFINITE},
    SchedClass, SynchFlags, ThreadInfo, ThreadState, TimerMode,
};
use std::sync::Mutex;

#[test]
fn init_rejects_invalid_flags() {
    let (pod, _arch) = pod_fixture(1);
    assert_eq!(
        pod.init_thread("bad", 10, ThreadState::READY, 0, SchedClass::Rt)
            .err(),
        Some(code::EINVAL)
    );
    assert_eq!(
        pod.init_thread("bad", 999, ThreadState::empty(), 0, SchedClass::Rt)
            .err(),
        Some(code::EINVAL)
    );
}

#[test]
fn init_leaves_thread_dormant() {
    let (pod, _arch) = pod_fixture(1);
    let rev = pod.threadq_rev();
    let t = pod
        .init_thread("embryo", 10, ThreadState::empty(), 0, SchedClass::Rt)
        .unwrap();
    assert!(pod.thread_state(t).unwrap().contains(ThreadState::DORMANT));
    assert!(!pod.thread_state(t).unwrap().contains(ThreadState::READY));
    assert_eq!(pod.threadq_rev(), rev + 1);

    // Creating in a suspended state stacks both conditions.
    let s = pod
        .init_thread("embryo2", 10, ThreadState::SUSPENDED, 0, SchedClass::Rt)
        .unwrap();
    let st = pod.thread_state(s).unwrap();
    assert!(st.contains(ThreadState::DORMANT | ThreadState::SUSPENDED));
}

#[test]
fn stack_pool_exhaustion() {
    let (pod, _arch) = pod_fixture(1);
    pod.init_thread("big1", 10, ThreadState::empty(), 64 * 1024, SchedClass::Rt)
        .unwrap();
    pod.init_thread("big2", 10, ThreadState::empty(), 64 * 1024, SchedClass::Rt)
        .unwrap();
    assert_eq!(
        pod.init_thread("big3", 10, ThreadState::empty(), 64 * 1024, SchedClass::Rt)
            .err(),
        Some(code::ENOMEM)
    );
}

#[test]
fn start_with_empty_affinity_is_refused() {
    let (pod, _arch) = pod_fixture(1);
    let t = pod
        .init_thread("nowhere", 10, ThreadState::empty(), 0, SchedClass::Rt)
        .unwrap();
    assert_eq!(
        pod.start_thread(t, ThreadState::empty(), 0, CpuMask::EMPTY, None, 0),
        Err(code::EINVAL)
    );
    assert!(pod.thread_state(t).unwrap().contains(ThreadState::DORMANT));
}

#[test]
fn start_twice_is_refused() {
    let (pod, _arch) = pod_fixture(1);
    let t = spawn(&pod, "once", 10);
    assert_eq!(
        pod.start_thread(t, ThreadState::empty(), 0, CpuMask::ALL, None, 0),
        Err(code::EBUSY)
    );
}

#[test]
fn init_start_delete_round_trip() {
    let (pod, _arch) = pod_fixture(1);
    let rev = pod.threadq_rev();
    let t = spawn(&pod, "transient", 30);
    assert_eq!(pod.current_thread(), t);

    // Self-deletion: the zombie is reaped behind the switch.
    pod.delete_thread(t).unwrap();
    assert_eq!(pod.current_thread(), pod.root_thread(0));
    assert_eq!(pod.thread_state(t), Err(code::EINVAL));
    assert_eq!(pod.threadq_rev(), rev + 2);

    // Deleting again is a no-op.
    assert_eq!(pod.delete_thread(t), Ok(()));
}

#[test]
fn delete_other_finalizes_inline() {
    let (pod, _arch) = pod_fixture(1);
    let hi = spawn(&pod, "deleter", 50);
    let lo = spawn(&pod, "victim", 10);
    assert_eq!(pod.current_thread(), hi);

    pod.delete_thread(lo).unwrap();
    assert_eq!(pod.thread_state(lo), Err(code::EINVAL));
    // The deleter kept the CPU throughout.
    assert_eq!(pod.current_thread(), hi);
}

#[test]
fn abort_suspends_then_deletes() {
    let (pod, _arch) = pod_fixture(1);
    let hi = spawn(&pod, "aborter", 50);
    let lo = spawn(&pod, "aborted", 10);
    assert_eq!(pod.current_thread(), hi);
    pod.abort_thread(lo).unwrap();
    assert_eq!(pod.thread_state(lo), Err(code::EINVAL));
}

static HOOK_LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn start_hook_one(_t: &Thread) {
    HOOK_LOG.lock().unwrap().push("one");
}

fn start_hook_two(_t: &Thread) {
    HOOK_LOG.lock().unwrap().push("two");
}

#[test]
fn hooks_fire_in_registration_reverse_order() {
    let (pod, _arch) = pod_fixture(1);
    HOOK_LOG.lock().unwrap().clear();
    pod.add_hook(rtpod::HookKind::Start, start_hook_one).unwrap();
    pod.add_hook(rtpod::HookKind::Start, start_hook_two).unwrap();

    spawn(&pod, "hooked", 30);
    assert_eq!(*HOOK_LOG.lock().unwrap(), vec!["two", "one"]);

    pod.remove_hook(rtpod::HookKind::Start, start_hook_one).unwrap();
    pod.remove_hook(rtpod::HookKind::Start, start_hook_two).unwrap();
    // Removing an absent hook is an error.
    assert_eq!(
        pod.remove_hook(rtpod::HookKind::Start, start_hook_one),
        Err(code::EINVAL)
    );
}

static DELETE_LOG: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn delete_hook(t: &Thread) {
    DELETE_LOG.lock().unwrap().push(t.name().to_string());
}

#[test]
fn delete_hooks_run_for_zombies_too() {
    let (pod, _arch) = pod_fixture(1);
    DELETE_LOG.lock().unwrap().clear();
    pod.add_hook(rtpod::HookKind::Delete, delete_hook).unwrap();

    // Inline finalization of a non-current thread.
    let hi = spawn(&pod, "surviving", 50);
    let lo = spawn(&pod, "inline_victim", 10);
    pod.delete_thread(lo).unwrap();
    assert_eq!(DELETE_LOG.lock().unwrap().last().unwrap(), "inline_victim");

    // Self-deletion goes through the zombie chain.
    pod.delete_thread(hi).unwrap();
    assert_eq!(DELETE_LOG.lock().unwrap().last().unwrap(), "surviving");
    pod.remove_hook(rtpod::HookKind::Delete, delete_hook).unwrap();
}

#[test]
fn restart_resets_priority_mode_and_signals() {
    let (pod, _arch) = pod_fixture(1);
    let keeper = spawn(&pod, "keeper", 90);
    let t = spawn_with(
        &pod,
        "restarted",
        30,
        ThreadState::empty(),
        ThreadState::ROUND_ROBIN,
        CpuMask::ALL,
    );
    assert_eq!(pod.current_thread(), keeper);

    pod.renice_thread(t, 70).unwrap();
    pod.post_signals(t, 0xff).unwrap();
    pod.set_thread_mode(t, ThreadState::ROUND_ROBIN, ThreadState::empty())
        .unwrap();

    pod.restart_thread(t).unwrap();
    assert_eq!(pod.thread_priorities(t).unwrap(), (30, 30, 30));
    let st = pod.thread_state(t).unwrap();
    assert!(st.contains(ThreadState::ROUND_ROBIN));
    assert!(!pod.thread_state(t).unwrap().contains(ThreadState::DORMANT));
}

#[test]
fn self_restart_goes_through_the_switch_path() {
    let (pod, _arch) = pod_fixture(1);
    let t = spawn(&pod, "reborn", 30);
    assert_eq!(pod.current_thread(), t);
    let csw = pod.thread_stats(t).unwrap().csw;

    pod.restart_thread(t).unwrap();
    assert_eq!(pod.current_thread(), t);
    assert!(pod.thread_stats(t).unwrap().csw > csw);
    assert!(pod
        .thread_state(t)
        .unwrap()
        .contains(ThreadState::RESTARTING));

    // The prologue run on the thread's behalf clears the restart mark.
    pod.welcome_thread();
    assert!(!pod
        .thread_state(t)
        .unwrap()
        .contains(ThreadState::RESTARTING));
}

#[cfg(debug_assertions)]
#[test]
#[should_panic]
fn restart_root_is_fatal() {
    let (pod, _arch) = pod_fixture(1);
    let root = pod.root_thread(0);
    let _ = pod.restart_thread(root);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic]
fn suspend_root_is_fatal() {
    let (pod, _arch) = pod_fixture(1);
    let root = pod.root_thread(0);
    let _ = pod.suspend_thread(root, ThreadState::SUSPENDED, INFINITE, TimerMode::Relative, None);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic]
fn conjunctive_wait_is_fatal() {
    let (pod, _arch) = pod_fixture(1);
    let t = spawn(&pod, "conjunctive", 30);
    let s1 = pod.create_synch(SynchFlags::PRIO);
    let s2 = pod.create_synch(SynchFlags::PRIO);
    pod.sleep_on(s1, INFINITE, TimerMode::Relative).unwrap();
    let _ = pod.suspend_thread(t, ThreadState::PENDING, INFINITE, TimerMode::Relative, Some(s2));
}

#[test]
fn suspend_resume_round_trip() {
    let (pod, _arch) = pod_fixture(1);
    let hi = spawn(&pod, "high", 50);
    let t = spawn(&pod, "bounced", 10);
    assert_eq!(pod.current_thread(), hi);
    assert!(pod.thread_state(t).unwrap().contains(ThreadState::READY));

    pod.suspend_thread(t, ThreadState::SUSPENDED, INFINITE, TimerMode::Relative, None)
        .unwrap();
    let st = pod.thread_state(t).unwrap();
    assert!(st.contains(ThreadState::SUSPENDED) && !st.contains(ThreadState::READY));

    pod.resume_thread(t, ThreadState::SUSPENDED).unwrap();
    let st = pod.thread_state(t).unwrap();
    assert!(st.contains(ThreadState::READY) && !st.contains(ThreadState::SUSPENDED));
}

#[test]
fn suspend_with_elapsed_absolute_deadline() {
    let (pod, _arch) = pod_fixture(1);
    let hi = spawn(&pod, "busy", 50);
    let t = spawn(&pod, "late", 10);
    let s = pod.create_synch(SynchFlags::PRIO);
    assert_eq!(pod.current_thread(), hi);

    ticks(&pod, 10);
    let ready_before = pod.ready_threads(0);

    pod.suspend_thread(t, ThreadState::PENDING, 5, TimerMode::Absolute, Some(s))
        .unwrap();

    // The run queue is untouched and the timeout cause is latched; the
    // wait channel was forgotten on the spot.
    assert_eq!(pod.ready_threads(0), ready_before);
    assert!(pod.thread_info(t).unwrap().contains(ThreadInfo::TIMEDOUT));
    assert_eq!(pod.thread_wchan(t).unwrap(), None);
    assert!(pod.thread_state(t).unwrap().contains(ThreadState::READY));
}

#[test]
fn unblock_unblocked_thread_is_harmless() {
    let (pod, _arch) = pod_fixture(1);
    let t = spawn(&pod, "awake", 30);
    assert!(!pod.unblock_thread(t).unwrap());
    assert!(!pod.thread_info(t).unwrap().contains(ThreadInfo::BROKEN));
}

#[test]
fn timesource_cycle() {
    let (pod, arch) = pod_fixture(1);
    assert_eq!(arch.running_timers(), vec![0]);

    pod.disable_timesource();
    assert!(arch.running_timers().is_empty());
    // A frozen wheel ignores ticks.
    let j = pod.jiffies();
    pod.clock_interrupt();
    assert_eq!(pod.jiffies(), j);

    pod.enable_timesource().unwrap();
    assert_eq!(arch.running_timers(), vec![0]);
    pod.clock_interrupt();
    assert_eq!(pod.jiffies(), j + 1);
}

#[test]
fn timesource_refusal_fails_init() {
    let arch = SimArch::leak(1);
    arch.refuse_timer();
    let pod = Pod::new(arch);
    assert_eq!(pod.init(), Err(code::ENODEV));
    assert!(!pod.active());
}

#[test]
fn pod_refcount() {
    let (pod, _arch) = pod_fixture(1);
    pod.init().unwrap();
    pod.shutdown(rtpod::pod::NORMAL_EXIT);
    assert!(pod.active());
    pod.shutdown(rtpod::pod::NORMAL_EXIT);
    assert!(!pod.active());
}

#[test]
fn periodic_release_points() {
    let (pod, _arch) = pod_fixture(1);
    let t = spawn(&pod, "periodic", 30);
    assert_eq!(pod.current_thread(), t);

    assert_eq!(pod.wait_thread_period(), Err(code::EWOULDBLOCK));

    pod.set_latency(5);
    assert_eq!(
        pod.set_thread_periodic(t, INFINITE, 2),
        Err(code::EINVAL)
    );

    pod.set_thread_periodic(t, INFINITE, 10).unwrap();
    assert_eq!(pod.wait_thread_period(), Ok(0));
    assert!(pod.thread_state(t).unwrap().contains(ThreadState::DELAYED));

    // The release point passes and the sleeper comes back.
    ticks(&pod, 10);
    assert_eq!(pod.current_thread(), t);

    // Sleeping through release points shows up as overruns, once.
    ticks(&pod, 25);
    let overruns = pod.wait_thread_period().unwrap();
    assert_eq!(overruns, 2);

    // Stopping periodic mode always succeeds.
    pod.set_thread_periodic(t, INFINITE, INFINITE).unwrap();
    assert_eq!(pod.wait_thread_period(), Err(code::EWOULDBLOCK));
}

#[test]
fn synch_wakeup_order_and_flush() {
    let (pod, _arch) = pod_fixture(1);
    let s = pod.create_synch(SynchFlags::PRIO);

    let a = spawn(&pod, "wait_a", 40);
    pod.sleep_on(s, INFINITE, TimerMode::Relative).unwrap();
    let b = spawn(&pod, "wait_b", 60);
    pod.sleep_on(s, INFINITE, TimerMode::Relative).unwrap();

    // Priority queuing: the higher sleeper wakes first.
    assert_eq!(pod.synch_wakeup_one(s).unwrap(), Some(b));
    assert!(pod.thread_info(b).unwrap().contains(ThreadInfo::WOKEN));
    assert!(pod.thread_state(b).unwrap().contains(ThreadState::READY));

    // Destroying the object flushes the remaining sleeper.
    pod.delete_synch(s).unwrap();
    assert!(pod
        .thread_info(a)
        .unwrap()
        .contains(ThreadInfo::SYNCH_GONE));
    assert!(pod.thread_state(a).unwrap().contains(ThreadState::READY));
    assert_eq!(pod.thread_wchan(a).unwrap(), None);
}

#[test]
fn fatal_helper_renders_thread_table() {
    let (pod, _arch) = pod_fixture(1);
    let t = spawn(&pod, "doomed_dump", 30);
    assert_eq!(pod.current_thread(), t);

    let report = pod.fatal_helper("something impossible happened");
    assert!(report.starts_with("something impossible happened"));
    assert!(report.contains("ROOT/0"));
    assert!(report.contains("doomed_dump"));
    assert!(report.contains(">0"));
    assert!(report.contains("Master time base: clock="));
    assert!(report.contains("Current CPU: #0"));
    assert!(pod.fatal_p());

    // Once fatal, later reports only carry the caller message.
    let again = pod.fatal_helper("again");
    assert_eq!(again, "again");
}

#[test]
fn mode_changes_reload_rr_credit_and_lock() {
    let (pod, _arch) = pod_fixture(1);
    let t = spawn(&pod, "moded", 30);
    assert_eq!(pod.current_thread(), t);

    let old = pod
        .set_thread_mode(t, ThreadState::empty(), ThreadState::LOCKED)
        .unwrap();
    assert!(old.is_empty());
    assert!(pod.thread_state(t).unwrap().contains(ThreadState::LOCKED));

    // Dropping the lock bit through the mode interface resets nesting.
    let old = pod
        .set_thread_mode(t, ThreadState::LOCKED, ThreadState::ROUND_ROBIN)
        .unwrap();
    assert!(old.contains(ThreadState::LOCKED));
    let st = pod.thread_state(t).unwrap();
    assert!(st.contains(ThreadState::ROUND_ROBIN) && !st.contains(ThreadState::LOCKED));
    pod.schedule();
    assert_eq!(pod.current_thread(), t);
}
