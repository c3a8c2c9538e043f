//! Socket-backed [`Transport`]
//!
//! Writes only queue bytes; the connection's driver task owns the fd,
//! flushes the outbox and reports completion back to the connection.

use alloc::vec::Vec;
use core::task::Waker;

use bridge_syscall as sys;
use bridge_websocket::{Transport, TransportError};

pub struct SocketTransport {
    fd: i32,
    outbox: Vec<u8>,
    reading: bool,
    open: bool,
    waker: Option<Waker>,
}

impl SocketTransport {
    pub fn new(fd: i32) -> Self {
        SocketTransport {
            fd,
            outbox: Vec::new(),
            reading: false,
            open: true,
            waker: None,
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.outbox)
    }

    /// Waker of the driver task, woken whenever there is something new to
    /// flush or the transport closes.
    pub(crate) fn set_waker(&mut self, waker: &Waker) {
        match &self.waker {
            Some(old) if old.will_wake(waker) => {}
            _ => self.waker = Some(waker.clone()),
        }
    }

    fn wake(&mut self) {
        if let Some(w) = self.waker.take() {
            w.wake();
        }
    }
}

impl Transport for SocketTransport {
    fn start_read(&mut self) {
        self.reading = true;
        self.wake();
    }

    fn stop_read(&mut self) {
        self.reading = false;
    }

    fn write(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        if self.outbox.is_empty() {
            self.outbox = data;
        } else {
            self.outbox.extend_from_slice(&data);
        }
        self.wake();
        Ok(())
    }

    /// Shuts the socket down in both directions. The fd itself is released
    /// by the driver once it notices.
    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.reading = false;
        self.outbox = Vec::new();
        let _ = sys::shutdown(self.fd, sys::SHUT_RDWR);
        self.wake();
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
