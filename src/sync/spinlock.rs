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

//! The executive's big lock. Acquisition disables interrupts on the local
//! CPU and returns a guard carrying the saved flags token; dropping the
//! guard releases the mutex first, then restores the interrupt state.

use crate::arch::ArchOps;
use core::{
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::atomic::{compiler_fence, Ordering},
};
use spin::{Mutex, MutexGuard};

#[derive(Debug)]
pub struct SpinIrqLock<T: ?Sized> {
    lock: Mutex<T>,
}

pub struct SpinIrqGuard<'a, T: ?Sized> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    arch: &'a dyn ArchOps,
    flags: usize,
}

impl<T> SpinIrqLock<T> {
    pub const fn new(val: T) -> Self {
        Self {
            lock: Mutex::new(val),
        }
    }
}

impl<T: ?Sized> SpinIrqLock<T> {
    pub fn lock_irqsave<'a>(&'a self, arch: &'a dyn ArchOps) -> SpinIrqGuard<'a, T> {
        let flags = arch.local_irq_save();
        compiler_fence(Ordering::SeqCst);
        let guard = self.lock.lock();
        SpinIrqGuard {
            guard: ManuallyDrop::new(guard),
            arch,
            flags,
        }
    }
}

impl<'a, T: 'a + ?Sized> Deref for SpinIrqGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<'a, T: 'a + ?Sized> DerefMut for SpinIrqGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

impl<'a, T: ?Sized> Drop for SpinIrqGuard<'a, T> {
    fn drop(&mut self) {
        // The mutex must be released before the interrupt state comes back.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        compiler_fence(Ordering::SeqCst);
        self.arch.local_irq_restore(self.flags);
    }
}

unsafe impl<T: ?Sized + Send> Send for SpinIrqLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinIrqLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimArch;

    #[test]
    fn guard_restores_irq_state() {
        let arch = SimArch::new(1);
        let lock = SpinIrqLock::new(17u32);
        {
            let mut g = lock.lock_irqsave(&arch);
            assert!(arch.irqs_off(0));
            *g += 1;
        }
        assert!(!arch.irqs_off(0));
        assert_eq!(*lock.lock_irqsave(&arch), 18);
    }

    #[test]
    fn nested_acquire_reacquire() {
        let arch = SimArch::new(1);
        let lock = SpinIrqLock::new(0u32);
        let g = lock.lock_irqsave(&arch);
        drop(g);
        let g = lock.lock_irqsave(&arch);
        assert_eq!(*g, 0);
    }
}
