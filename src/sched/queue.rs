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

//! Ordered ready set of one CPU. Priority bands are FIFO; an occupancy
//! bitmap finds the highest non-empty band in a few word scans. A
//! higher-class runnable thread always beats any lower-class one.

use super::SchedClass;
use crate::{
    thread::ThreadId,
    types::{Prio, PRIO_MAX, PRIO_MIN},
};
use alloc::{collections::VecDeque, vec::Vec};

const PRIO_LEVELS: usize = (PRIO_MAX - PRIO_MIN + 1) as usize;
const MAP_WORDS: usize = PRIO_LEVELS / 64;

/// One scheduling class's band array.
#[derive(Debug)]
pub(crate) struct MultiLevelQueue {
    bands: Vec<VecDeque<ThreadId>>,
    map: [u64; MAP_WORDS],
    len: usize,
}

impl MultiLevelQueue {
    pub(crate) fn new() -> Self {
        let mut bands = Vec::with_capacity(PRIO_LEVELS);
        bands.resize_with(PRIO_LEVELS, VecDeque::new);
        Self {
            bands,
            map: [0; MAP_WORDS],
            len: 0,
        }
    }

    fn band(prio: Prio) -> usize {
        debug_assert!((PRIO_MIN..=PRIO_MAX).contains(&prio));
        (prio - PRIO_MIN) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append behind every peer of the band.
    pub(crate) fn enqueue(&mut self, prio: Prio, t: ThreadId) {
        let b = Self::band(prio);
        self.bands[b].push_back(t);
        self.map[b / 64] |= 1 << (b % 64);
        self.len += 1;
    }

    /// Reinsert ahead of the band, preserving the running thread's claim
    /// over equal-priority peers.
    pub(crate) fn requeue(&mut self, prio: Prio, t: ThreadId) {
        let b = Self::band(prio);
        self.bands[b].push_front(t);
        self.map[b / 64] |= 1 << (b % 64);
        self.len += 1;
    }

    pub(crate) fn dequeue(&mut self, prio: Prio, t: ThreadId) {
        let b = Self::band(prio);
        if let Some(pos) = self.bands[b].iter().position(|&x| x == t) {
            self.bands[b].remove(pos);
            self.len -= 1;
            if self.bands[b].is_empty() {
                self.map[b / 64] &= !(1 << (b % 64));
            }
        } else {
            debug_assert!(false, "thread not linked in its priority band");
        }
    }

    fn highest_band(&self) -> Option<usize> {
        for w in (0..MAP_WORDS).rev() {
            if self.map[w] != 0 {
                return Some(w * 64 + 63 - self.map[w].leading_zeros() as usize);
            }
        }
        None
    }

    /// Take the head of the highest non-empty band.
    pub(crate) fn pick(&mut self) -> Option<ThreadId> {
        let b = self.highest_band()?;
        let t = self.bands[b].pop_front().expect("bitmap out of sync");
        self.len -= 1;
        if self.bands[b].is_empty() {
            self.map[b / 64] &= !(1 << (b % 64));
        }
        Some(t)
    }

    /// Snapshot in pick order, for diagnostics.
    pub(crate) fn iter_ordered(&self) -> Vec<ThreadId> {
        let mut out = Vec::with_capacity(self.len);
        for b in (0..PRIO_LEVELS).rev() {
            out.extend(self.bands[b].iter().copied());
        }
        out
    }
}

/// Per-CPU run queue, one band array per scheduling class.
#[derive(Debug)]
pub(crate) struct RunQueue {
    rt: MultiLevelQueue,
    idle: MultiLevelQueue,
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            rt: MultiLevelQueue::new(),
            idle: MultiLevelQueue::new(),
        }
    }

    fn class(&mut self, class: SchedClass) -> &mut MultiLevelQueue {
        match class {
            SchedClass::Rt => &mut self.rt,
            SchedClass::Idle => &mut self.idle,
        }
    }

    pub(crate) fn enqueue(&mut self, class: SchedClass, prio: Prio, t: ThreadId) {
        self.class(class).enqueue(prio, t);
    }

    pub(crate) fn requeue(&mut self, class: SchedClass, prio: Prio, t: ThreadId) {
        self.class(class).requeue(prio, t);
    }

    pub(crate) fn dequeue(&mut self, class: SchedClass, prio: Prio, t: ThreadId) {
        self.class(class).dequeue(prio, t);
    }

    pub(crate) fn pick(&mut self) -> Option<ThreadId> {
        self.rt.pick().or_else(|| self.idle.pick())
    }

    pub(crate) fn iter_ordered(&self) -> Vec<ThreadId> {
        let mut out = self.rt.iter_ordered();
        out.extend(self.idle.iter_ordered());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(n: u32) -> ThreadId {
        ThreadId::new(n, 0)
    }

    #[test]
    fn highest_band_wins() {
        let mut q = MultiLevelQueue::new();
        q.enqueue(10, tid(1));
        q.enqueue(50, tid(2));
        q.enqueue(30, tid(3));
        assert_eq!(q.pick(), Some(tid(2)));
        assert_eq!(q.pick(), Some(tid(3)));
        assert_eq!(q.pick(), Some(tid(1)));
        assert_eq!(q.pick(), None);
    }

    #[test]
    fn fifo_within_band_and_requeue_at_head() {
        let mut q = MultiLevelQueue::new();
        q.enqueue(30, tid(1));
        q.enqueue(30, tid(2));
        q.requeue(30, tid(3));
        assert_eq!(q.pick(), Some(tid(3)));
        assert_eq!(q.pick(), Some(tid(1)));
        assert_eq!(q.pick(), Some(tid(2)));
    }

    #[test]
    fn dequeue_clears_bitmap() {
        let mut q = MultiLevelQueue::new();
        q.enqueue(200, tid(1));
        q.enqueue(100, tid(2));
        q.dequeue(200, tid(1));
        assert_eq!(q.pick(), Some(tid(2)));
        assert!(q.is_empty());
    }

    #[test]
    fn rt_class_beats_idle_class() {
        let mut rq = RunQueue::new();
        rq.enqueue(SchedClass::Idle, 255, tid(9));
        rq.enqueue(SchedClass::Rt, 0, tid(1));
        assert_eq!(rq.pick(), Some(tid(1)));
        assert_eq!(rq.pick(), Some(tid(9)));
    }
}
