//! Task scheduler - slot storage with generation-tagged handles, polled on
//! a single thread

use crate::io_registry::IoRegistry;
use crate::timer::{Sleep, TimerQueue};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::task::Wake;
use alloc::vec::Vec;
use bridge_syscall as sys;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicU64, Ordering};
use core::task::{Context, Poll, Waker};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Shared {
    ready: spin::Mutex<VecDeque<usize>>,
    spawned: spin::Mutex<Vec<BoxFuture>>,
    io: spin::Mutex<IoRegistry>,
    timers: spin::Mutex<TimerQueue>,
    next_timer: AtomicU64,
}

impl Shared {
    fn schedule(&self, handle: usize) {
        let mut ready = self.ready.lock();
        if !ready.contains(&handle) {
            ready.push_back(handle);
        }
    }

    fn pop_ready(&self) -> Option<usize> {
        self.ready.lock().pop_front()
    }

    /// Block in ppoll until an fd is ready, a timer is due, or `deadline_ms`
    /// passes. Returns false when there is nothing that could ever wake us.
    fn wait(&self, now_ms: u64, deadline_ms: Option<u64>) -> bool {
        let timer_at = self.timers.lock().next_deadline();
        let wake_at = match (timer_at, deadline_ms) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let mut fds = self.io.lock().snapshot();
        if fds.is_empty() && wake_at.is_none() {
            return false;
        }

        let timeout = wake_at.map(|t| t.saturating_sub(now_ms));
        let mut to_wake = Vec::new();
        match sys::ppoll(&mut fds, timeout) {
            Ok(n) if n > 0 => to_wake.extend(self.io.lock().drain_ready(&fds)),
            Ok(_) => {}
            Err(e) if e == sys::Errno::EINTR => {}
            Err(e) => log::warn!("ppoll failed: {}", e),
        }
        to_wake.extend(self.timers.lock().expire(sys::monotonic_ms()));
        for w in to_wake {
            w.wake();
        }
        true
    }
}

struct TaskWaker {
    handle: usize,
    shared: Weak<Shared>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.schedule(self.handle);
        }
    }
}

/// Cloneable access to the event loop from inside tasks.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Queue a task; the runtime adopts it before its next poll round.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shared.spawned.lock().push(Box::pin(future));
    }

    /// Wake `waker` once `fd` reports any of `events`.
    pub fn register_fd_waker(&self, fd: i32, events: i16, waker: Waker) {
        self.shared.io.lock().register(fd, events, waker);
    }

    /// Drop all interest in `fd` and wake its waiters so they observe
    /// whatever happened to it (typically a close).
    pub fn wake_fd(&self, fd: i32) {
        let waiters = self.shared.io.lock().take(fd);
        for w in waiters {
            w.wake();
        }
    }

    pub fn now_ms(&self) -> u64 {
        sys::monotonic_ms()
    }

    pub fn sleep(&self, ms: u64) -> Sleep {
        self.sleep_until(self.now_ms().saturating_add(ms))
    }

    pub fn sleep_until(&self, deadline_ms: u64) -> Sleep {
        let id = self.shared.next_timer.fetch_add(1, Ordering::Relaxed);
        Sleep::new(self.clone(), id, deadline_ms)
    }

    pub(crate) fn arm_timer(&self, id: u64, deadline_ms: u64, waker: Waker) {
        self.shared.timers.lock().arm(id, deadline_ms, waker);
    }

    pub(crate) fn cancel_timer(&self, id: u64) {
        self.shared.timers.lock().cancel(id);
    }
}

struct Slot {
    generation: u32,
    task: Option<BoxFuture>,
}

/// Owns every task and drives them on the calling thread.
pub struct Runtime {
    handle: Handle,
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            handle: Handle {
                shared: Arc::new(Shared {
                    ready: spin::Mutex::new(VecDeque::new()),
                    spawned: spin::Mutex::new(Vec::new()),
                    io: spin::Mutex::new(IoRegistry::default()),
                    timers: spin::Mutex::new(TimerQueue::default()),
                    next_timer: AtomicU64::new(1),
                }),
            },
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.adopt(Box::pin(future));
    }

    /// Number of tasks that have not yet completed.
    pub fn live_tasks(&self) -> usize {
        self.live
    }

    /// Run until `done` returns true. Returns false if every task finished
    /// or stalled first.
    pub fn run_until(&mut self, mut done: impl FnMut() -> bool) -> bool {
        self.drive(&mut done, None)
    }

    /// Like [`Runtime::run_until`] but gives up after `max_ms`.
    pub fn run_for(&mut self, max_ms: u64, mut done: impl FnMut() -> bool) -> bool {
        let deadline = sys::monotonic_ms().saturating_add(max_ms);
        self.drive(&mut done, Some(deadline))
    }

    fn drive(&mut self, done: &mut dyn FnMut() -> bool, deadline: Option<u64>) -> bool {
        loop {
            self.adopt_spawned();
            while let Some(h) = self.handle.shared.pop_ready() {
                self.poll_task(h);
                self.adopt_spawned();
            }
            if done() {
                return true;
            }
            let now = sys::monotonic_ms();
            if deadline.is_some_and(|d| now >= d) || self.live == 0 {
                return false;
            }
            if !self.handle.shared.wait(now, deadline) {
                log::warn!("{} task(s) stalled with nothing to wait on", self.live);
                return false;
            }
        }
    }

    fn adopt_spawned(&mut self) {
        let spawned = core::mem::take(&mut *self.handle.shared.spawned.lock());
        for task in spawned {
            self.adopt(task);
        }
    }

    fn adopt(&mut self, task: BoxFuture) {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx].task = Some(task);
                idx
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    task: Some(task),
                });
                self.slots.len() - 1
            }
        };
        self.live += 1;
        let handle = (idx << 32) | (self.slots[idx].generation as usize);
        self.handle.shared.schedule(handle);
    }

    fn poll_task(&mut self, handle: usize) {
        let idx = handle >> 32;
        let generation = (handle & 0xFFFF_FFFF) as u32;
        let Some(slot) = self.slots.get_mut(idx) else {
            return;
        };
        if slot.generation != generation {
            return;
        }
        // Taken out while polling so a task may spawn without re-entering the slab.
        let Some(mut task) = slot.task.take() else {
            return;
        };

        let waker = Waker::from(Arc::new(TaskWaker {
            handle,
            shared: Arc::downgrade(&self.handle.shared),
        }));
        let mut cx = Context::from_waker(&waker);
        match task.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                let slot = &mut self.slots[idx];
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(idx);
                self.live -= 1;
            }
            Poll::Pending => self.slots[idx].task = Some(task),
        }
    }
}
