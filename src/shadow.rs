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

//! Cross-domain relay for threads owning a host-OS twin. The executive
//! invokes the bridge at a handful of fixed points and never references
//! the host directly; without an installed bridge the pod behaves as if
//! pervasive shadows were compiled out.

use crate::{thread::ThreadId, types::Prio};

pub const SIGKILL: i32 = 9;

/// Host-side relay. Calls arrive with the pod lock held unless noted;
/// implementations must not re-enter the pod from those.
pub trait ShadowBridge: Send + Sync {
    /// A thread flagged as a shadow is being started: hand the wakeup to
    /// the host twin. Called with the pod lock released.
    fn start(&self, t: ThreadId);

    /// A relaxed, non-current shadow is the target of a suspension: force
    /// the twin back to primary mode so the executive can stop it.
    fn suspend(&self, t: ThreadId);

    /// Propagate a priority change to the host twin's scheduler.
    fn renice(&self, t: ThreadId, prio: Prio);

    /// Deliver an asynchronous host signal to the twin.
    fn send_sig(&self, t: ThreadId, sig: i32, group: bool);

    /// Reap the host mate of a deleted shadow from the relax epilogue.
    /// Called with the pod lock released.
    fn exit(&self);

    /// Demote the current thread to secondary mode.
    fn relax(&self, notify: bool);

    /// Re-evaluate the interrupt shield of the current shadow.
    fn reset_shield(&self);

    /// Cross-domain priority check requested through an IPI.
    fn rpi_check(&self);

    /// Whether the twin still carries its shadow hook. The relax epilogue
    /// reaps the mate of a deleted shadow when this turns false.
    fn thread_mapped(&self, t: ThreadId) -> bool;
}

#[cfg(any(test, feature = "sim"))]
pub mod recorder {
    //! Recording bridge used by the hosted test suite.

    use super::*;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, Ordering};
    use spin::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Event {
        Start(ThreadId),
        Suspend(ThreadId),
        Renice(ThreadId, Prio),
        SendSig(ThreadId, i32),
        Exit,
        Relax(bool),
        ResetShield,
        RpiCheck,
    }

    #[derive(Default)]
    pub struct RecordingBridge {
        events: Mutex<Vec<Event>>,
        unmapped: AtomicBool,
    }

    impl RecordingBridge {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn leak() -> &'static Self {
            alloc::boxed::Box::leak(alloc::boxed::Box::new(Self::new()))
        }

        pub fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }

        pub fn take_events(&self) -> Vec<Event> {
            core::mem::take(&mut *self.events.lock())
        }

        /// Make `thread_mapped` report the twin as gone.
        pub fn set_unmapped(&self, on: bool) {
            self.unmapped.store(on, Ordering::SeqCst);
        }

        fn push(&self, e: Event) {
            self.events.lock().push(e);
        }
    }

    impl ShadowBridge for RecordingBridge {
        fn start(&self, t: ThreadId) {
            self.push(Event::Start(t));
        }

        fn suspend(&self, t: ThreadId) {
            self.push(Event::Suspend(t));
        }

        fn renice(&self, t: ThreadId, prio: Prio) {
            self.push(Event::Renice(t, prio));
        }

        fn send_sig(&self, t: ThreadId, sig: i32, _group: bool) {
            self.push(Event::SendSig(t, sig));
        }

        fn exit(&self) {
            self.push(Event::Exit);
        }

        fn relax(&self, notify: bool) {
            self.push(Event::Relax(notify));
        }

        fn reset_shield(&self) {
            self.push(Event::ResetShield);
        }

        fn rpi_check(&self) {
            self.push(Event::RpiCheck);
        }

        fn thread_mapped(&self, _t: ThreadId) -> bool {
            !self.unmapped.load(Ordering::SeqCst)
        }
    }
}
