//! IO event registry for async file descriptor operations

use alloc::vec::Vec;
use bridge_syscall::{self as sys, PollFd};
use core::task::Waker;

pub struct IoEntry {
    pub fd: i32,
    pub events: i16,
    pub waiters: Vec<Waker>,
}

#[derive(Default)]
pub struct IoRegistry {
    entries: Vec<IoEntry>,
}

impl IoRegistry {
    pub fn register(&mut self, fd: i32, events: i16, waker: Waker) {
        for e in self.entries.iter_mut() {
            if e.fd == fd {
                e.events |= events;
                if !e.waiters.iter().any(|w| w.will_wake(&waker)) {
                    e.waiters.push(waker);
                }
                return;
            }
        }
        self.entries.push(IoEntry {
            fd,
            events,
            waiters: alloc::vec![waker],
        });
    }

    /// Drop interest in `fd`, returning whoever was waiting on it.
    pub fn take(&mut self, fd: i32) -> Vec<Waker> {
        match self.entries.iter().position(|e| e.fd == fd) {
            Some(i) => self.entries.swap_remove(i).waiters,
            None => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PollFd> {
        self.entries
            .iter()
            .map(|e| PollFd {
                fd: e.fd,
                events: e.events,
                revents: 0,
            })
            .collect()
    }

    /// Collect wakers for every fd `ppoll` flagged. Entries are removed;
    /// a task that still needs the fd re-registers on its next poll.
    pub fn drain_ready(&mut self, polled: &[PollFd]) -> Vec<Waker> {
        let mut to_wake = Vec::new();
        for pf in polled.iter().filter(|pf| pf.revents != 0) {
            let is_closed = (pf.revents & (sys::POLLERR | sys::POLLHUP | sys::POLLNVAL)) != 0;
            if is_closed {
                log::debug!("fd={} revents={:#x} (closed)", pf.fd, pf.revents);
            }
            to_wake.extend(self.take(pf.fd));
        }
        to_wake
    }
}
