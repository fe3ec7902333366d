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

//! Tick-driven timer wheel backing thread delays, periodic releases, host
//! tick emulation and the per-CPU watchdog. Expiry never calls back into
//! the executive: the wheel returns a batch of closed-enum actions the
//! clock interrupt handler applies with the pod lock already held.

use crate::{
    error::{code, Result},
    thread::ThreadId,
    types::{STicks, Ticks, TimerMode},
};
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    index: u32,
    gen: u32,
}

impl TimerId {
    pub const INVALID: TimerId = TimerId {
        index: u32::MAX,
        gen: 0,
    };
}

/// What firing a timer means. Applied by the clock interrupt handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerAction {
    /// A bounded wait elapsed: wake the sleeper with a timeout cause.
    ThreadTimeout(ThreadId),
    /// A periodic release point was reached.
    ThreadPeriod(ThreadId),
    /// Relay the host tick on this CPU.
    HostTick(u32),
    /// Watchdog heartbeat on this CPU.
    Watchdog(u32),
}

#[derive(Debug)]
struct Timer {
    date: Ticks,
    interval: Ticks,
    cpu: u32,
    action: TimerAction,
    running: bool,
    /// Next expected periodic release point, for overrun accounting.
    pexpect: Ticks,
}

#[derive(Debug, Default)]
struct Slot {
    gen: u32,
    t: Option<Timer>,
}

#[derive(Debug, Default)]
pub(crate) struct TimerWheel {
    slots: Vec<Slot>,
    free: Vec<u32>,
    jiffies: Ticks,
    wallclock_offset: STicks,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn jiffies(&self) -> Ticks {
        self.jiffies
    }

    pub(crate) fn wallclock_offset(&self) -> STicks {
        self.wallclock_offset
    }

    pub(crate) fn set_wallclock_offset(&mut self, off: STicks) {
        self.wallclock_offset = off;
    }

    pub(crate) fn create(&mut self, action: TimerAction, cpu: u32) -> TimerId {
        let t = Timer {
            date: 0,
            interval: 0,
            cpu,
            action,
            running: false,
            pexpect: 0,
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.t = Some(t);
            TimerId {
                index,
                gen: slot.gen,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { gen: 0, t: Some(t) });
            TimerId { index, gen: 0 }
        }
    }

    fn get(&self, id: TimerId) -> Option<&Timer> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.t.as_ref()
    }

    fn get_mut(&mut self, id: TimerId) -> Option<&mut Timer> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.t.as_mut()
    }

    pub(crate) fn destroy(&mut self, id: TimerId) {
        if let Some(slot) = self.slots.get_mut(id.index as usize) {
            if slot.gen == id.gen && slot.t.take().is_some() {
                slot.gen = slot.gen.wrapping_add(1);
                self.free.push(id.index);
            }
        }
    }

    /// Arm a timer. Fails with ETIMEDOUT when an absolute date has already
    /// elapsed, leaving the timer stopped.
    pub(crate) fn start(
        &mut self,
        id: TimerId,
        value: Ticks,
        interval: Ticks,
        mode: TimerMode,
    ) -> Result {
        let now = self.jiffies;
        let offset = self.wallclock_offset;
        let t = self.get_mut(id).ok_or(code::EINVAL)?;
        let date = match mode {
            TimerMode::Relative => now.saturating_add(value),
            TimerMode::Absolute => value,
            TimerMode::Realtime => {
                let d = value as STicks - offset;
                if d < 0 {
                    t.running = false;
                    return Err(code::ETIMEDOUT);
                }
                d as Ticks
            }
        };
        if mode != TimerMode::Relative && date <= now {
            t.running = false;
            return Err(code::ETIMEDOUT);
        }
        t.date = date;
        t.interval = interval;
        t.pexpect = date;
        t.running = true;
        Ok(())
    }

    /// Disarm. Stopping an idle timer is a no-op.
    pub(crate) fn stop(&mut self, id: TimerId) {
        if let Some(t) = self.get_mut(id) {
            t.running = false;
        }
    }

    pub(crate) fn running_p(&self, id: TimerId) -> bool {
        self.get(id).map(|t| t.running).unwrap_or(false)
    }

    pub(crate) fn interval(&self, id: TimerId) -> Ticks {
        self.get(id).map(|t| t.interval).unwrap_or(0)
    }

    /// Rebind the timer to another CPU's clock.
    pub(crate) fn set_sched(&mut self, id: TimerId, cpu: u32) {
        if let Some(t) = self.get_mut(id) {
            t.cpu = cpu;
        }
    }

    /// Remaining ticks before expiry, zero when idle.
    pub(crate) fn get_timeout(&self, id: TimerId, now: Ticks) -> Ticks {
        match self.get(id) {
            Some(t) if t.running => t.date.saturating_sub(now),
            _ => 0,
        }
    }

    pub(crate) fn pexpect(&self, id: TimerId) -> Ticks {
        self.get(id).map(|t| t.pexpect).unwrap_or(0)
    }

    pub(crate) fn pexpect_forward(&mut self, id: TimerId, delta: Ticks) {
        if let Some(t) = self.get_mut(id) {
            t.pexpect = t.pexpect.saturating_add(delta);
        }
    }

    /// Count release points missed since the last call, advancing the
    /// expectation so each overrun is reported once.
    pub(crate) fn get_overruns(&mut self, id: TimerId, now: Ticks) -> Ticks {
        let Some(t) = self.get_mut(id) else { return 0 };
        if t.interval == 0 {
            return 0;
        }
        let delta = now as STicks - t.pexpect as STicks;
        if delta < t.interval as STicks {
            return 0;
        }
        let overruns = delta as Ticks / t.interval;
        t.pexpect = t.pexpect.saturating_add(overruns * t.interval);
        overruns
    }

    /// Stop every armed timer. Used when the time source goes away.
    pub(crate) fn freeze(&mut self) {
        for slot in &mut self.slots {
            if let Some(t) = slot.t.as_mut() {
                t.running = false;
            }
        }
    }

    /// Advance the tick line by one and collect the due actions, earliest
    /// date first. Periodic timers re-arm themselves.
    pub(crate) fn tick(&mut self) -> Vec<TimerAction> {
        self.jiffies += 1;
        let now = self.jiffies;
        let mut due: Vec<(Ticks, TimerAction)> = Vec::new();
        for slot in &mut self.slots {
            let Some(t) = slot.t.as_mut() else { continue };
            if !t.running || t.date > now {
                continue;
            }
            due.push((t.date, t.action));
            if t.interval != 0 {
                while t.date <= now {
                    t.date += t.interval;
                }
            } else {
                t.running = false;
            }
        }
        due.sort_by_key(|(date, _)| *date);
        due.into_iter().map(|(_, a)| a).collect()
    }
}
