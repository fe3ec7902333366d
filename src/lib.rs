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

//! Hard real-time executive core designed to coexist with a
//! general-purpose host OS. The pod owns a fixed set of per-CPU run
//! queues, the thread lifecycle, and the central rescheduling routine
//! honoring priority, round-robin, preemption-lock and
//! priority-inheritance constraints. API personalities stack on top; the
//! architecture glue and the optional host bridge plug in through traits.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod error;
mod fpu;
pub mod pod;
pub mod sched;
pub mod shadow;
pub mod synch;
pub mod sync;
pub mod thread;
pub mod timer;
pub mod types;

pub use error::{code, Error, Result};
pub use pod::{init_instance, instance, HookFn, HookKind, Pod, PodFlags};
pub use sched::SchedClass;
pub use shadow::ShadowBridge;
pub use synch::{SynchFlags, SynchId};
pub use thread::{ThreadId, ThreadInfo, ThreadState};
pub use types::{CpuMask, Prio, Ticks, TimerMode, INFINITE};
