//! Deadline timers driven by the ppoll timeout

use crate::scheduler::Handle;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

struct TimerEntry {
    id: u64,
    deadline_ms: u64,
    waker: Waker,
}

#[derive(Default)]
pub struct TimerQueue {
    entries: Vec<TimerEntry>,
}

impl TimerQueue {
    /// Arm (or re-arm) timer `id`.
    pub fn arm(&mut self, id: u64, deadline_ms: u64, waker: Waker) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.id == id) {
            e.deadline_ms = deadline_ms;
            e.waker = waker;
            return;
        }
        self.entries.push(TimerEntry {
            id,
            deadline_ms,
            waker,
        });
    }

    pub fn cancel(&mut self, id: u64) {
        self.entries.retain(|e| e.id != id);
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.deadline_ms).min()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn expire(&mut self, now_ms: u64) -> Vec<Waker> {
        let mut fired = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            if self.entries[i].deadline_ms <= now_ms {
                fired.push(self.entries.swap_remove(i).waker);
            } else {
                i += 1;
            }
        }
        fired
    }
}

/// Future that completes once the monotonic clock passes its deadline.
pub struct Sleep {
    handle: Handle,
    id: u64,
    deadline_ms: u64,
}

impl Sleep {
    pub(crate) fn new(handle: Handle, id: u64, deadline_ms: u64) -> Self {
        Self {
            handle,
            id,
            deadline_ms,
        }
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.handle.now_ms() >= self.deadline_ms {
            self.handle.cancel_timer(self.id);
            return Poll::Ready(());
        }
        self.handle
            .arm_timer(self.id, self.deadline_ms, cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.handle.cancel_timer(self.id);
    }
}
