//! Minimal x86_64 Linux syscall wrappers - only what the bridge uses

#![cfg_attr(not(test), no_std)]

use core::fmt;

// Core syscalls
unsafe fn syscall1(n: u64, a1: u64) -> i64 {
    let ret: i64;
    unsafe {
        core::arch::asm!(
            "syscall",
            in("rax") n,
            in("rdi") a1,
            lateout("rax") ret,
            lateout("rcx") _,
            lateout("r11") _,
        );
    }
    ret
}

unsafe fn syscall2(n: u64, a1: u64, a2: u64) -> i64 {
    let ret: i64;
    unsafe {
        core::arch::asm!(
            "syscall",
            in("rax") n,
            in("rdi") a1,
            in("rsi") a2,
            lateout("rax") ret,
            lateout("rcx") _,
            lateout("r11") _,
        );
    }
    ret
}

unsafe fn syscall3(n: u64, a1: u64, a2: u64, a3: u64) -> i64 {
    let ret: i64;
    unsafe {
        core::arch::asm!(
            "syscall",
            in("rax") n,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            lateout("rax") ret,
            lateout("rcx") _,
            lateout("r11") _,
        );
    }
    ret
}

unsafe fn syscall4(n: u64, a1: u64, a2: u64, a3: u64, a4: u64) -> i64 {
    let ret: i64;
    unsafe {
        core::arch::asm!(
            "syscall",
            in("rax") n,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4,
            lateout("rax") ret,
            lateout("rcx") _,
            lateout("r11") _,
        );
    }
    ret
}

unsafe fn syscall5(n: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> i64 {
    let ret: i64;
    unsafe {
        core::arch::asm!(
            "syscall",
            in("rax") n,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4,
            in("r8") a5,
            lateout("rax") ret,
            lateout("rcx") _,
            lateout("r11") _,
        );
    }
    ret
}

unsafe fn syscall6(n: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64) -> i64 {
    let ret: i64;
    unsafe {
        core::arch::asm!(
            "syscall",
            in("rax") n,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4,
            in("r8") a5,
            in("r9") a6,
            lateout("rax") ret,
            lateout("rcx") _,
            lateout("r11") _,
        );
    }
    ret
}

const SYS_READ: u64 = 0;
const SYS_WRITE: u64 = 1;
const SYS_CLOSE: u64 = 3;
const SYS_MMAP: u64 = 9;
const SYS_MUNMAP: u64 = 11;
const SYS_SOCKET: u64 = 41;
const SYS_CONNECT: u64 = 42;
const SYS_SENDTO: u64 = 44;
const SYS_RECVFROM: u64 = 45;
const SYS_SHUTDOWN: u64 = 48;
const SYS_BIND: u64 = 49;
const SYS_LISTEN: u64 = 50;
const SYS_GETSOCKNAME: u64 = 51;
const SYS_GETPEERNAME: u64 = 52;
const SYS_SETSOCKOPT: u64 = 54;
const SYS_CLOCK_GETTIME: u64 = 228;
const SYS_EXIT_GROUP: u64 = 231;
const SYS_OPENAT: u64 = 257;
const SYS_PPOLL: u64 = 271;
const SYS_ACCEPT4: u64 = 288;
const SYS_GETRANDOM: u64 = 318;

/// A raw kernel error number, as returned negated by the syscall instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const EINTR: Errno = Errno(4);
    pub const EBADF: Errno = Errno(9);
    pub const EAGAIN: Errno = Errno(11);
    pub const ENOMEM: Errno = Errno(12);
    pub const EACCES: Errno = Errno(13);
    pub const EINVAL: Errno = Errno(22);
    pub const EPIPE: Errno = Errno(32);
    pub const EADDRINUSE: Errno = Errno(98);
    pub const EADDRNOTAVAIL: Errno = Errno(99);
    pub const ECONNRESET: Errno = Errno(104);
    pub const ENOTCONN: Errno = Errno(107);
    pub const ECONNREFUSED: Errno = Errno(111);
    pub const EINPROGRESS: Errno = Errno(115);

    /// True for errors that mean "retry once the fd is ready".
    pub fn is_would_block(self) -> bool {
        self == Errno::EAGAIN || self == Errno::EINPROGRESS || self == Errno::EINTR
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Errno::EINTR => "EINTR",
            Errno::EBADF => "EBADF",
            Errno::EAGAIN => "EAGAIN",
            Errno::ENOMEM => "ENOMEM",
            Errno::EACCES => "EACCES",
            Errno::EINVAL => "EINVAL",
            Errno::EPIPE => "EPIPE",
            Errno::EADDRINUSE => "EADDRINUSE",
            Errno::EADDRNOTAVAIL => "EADDRNOTAVAIL",
            Errno::ECONNRESET => "ECONNRESET",
            Errno::ENOTCONN => "ENOTCONN",
            Errno::ECONNREFUSED => "ECONNREFUSED",
            Errno::EINPROGRESS => "EINPROGRESS",
            _ => return None,
        })
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (errno {})", name, self.0),
            None => write!(f, "errno {}", self.0),
        }
    }
}

pub type SysResult<T> = Result<T, Errno>;

#[inline]
fn check(ret: i64) -> SysResult<usize> {
    if ret < 0 {
        Err(Errno((-ret) as i32))
    } else {
        Ok(ret as usize)
    }
}

// Public API - only used syscalls
pub fn write(fd: i32, buf: &[u8]) -> SysResult<usize> {
    check(unsafe { syscall3(SYS_WRITE, fd as u64, buf.as_ptr() as u64, buf.len() as u64) })
}

pub fn read(fd: i32, buf: &mut [u8]) -> SysResult<usize> {
    check(unsafe { syscall3(SYS_READ, fd as u64, buf.as_mut_ptr() as u64, buf.len() as u64) })
}

pub fn close(fd: i32) -> SysResult<()> {
    check(unsafe { syscall1(SYS_CLOSE, fd as u64) }).map(|_| ())
}

pub fn exit(code: i32) -> ! {
    unsafe {
        syscall1(SYS_EXIT_GROUP, code as u64);
    }
    loop {
        core::hint::spin_loop();
    }
}

pub const PROT_RW: i32 = 0x3;
pub const MAP_PRIVATE_ANON: i32 = 0x22;

pub fn mmap(addr: usize, len: usize, prot: i32, flags: i32) -> *mut u8 {
    let ret = unsafe { syscall6(SYS_MMAP, addr as u64, len as u64, prot as u64, flags as u64, !0, 0) };
    if ret < 0 {
        core::ptr::null_mut()
    } else {
        ret as *mut u8
    }
}

/// # Safety
/// `addr..addr+len` must be a mapping previously returned by [`mmap`] that
/// nothing references any more.
pub unsafe fn munmap(addr: *mut u8, len: usize) -> SysResult<()> {
    check(unsafe { syscall2(SYS_MUNMAP, addr as u64, len as u64) }).map(|_| ())
}

pub const AT_FDCWD: i32 = -100;
pub const O_WRONLY: i32 = 0o1;
pub const O_CREAT: i32 = 0o100;
pub const O_APPEND: i32 = 0o2000;
pub const O_CLOEXEC: i32 = 0o2000000;

/// Open `path`, which must be NUL-terminated.
pub fn open(path: &[u8], flags: i32, mode: u32) -> SysResult<i32> {
    if path.last() != Some(&0) {
        return Err(Errno::EINVAL);
    }
    check(unsafe {
        syscall4(
            SYS_OPENAT,
            AT_FDCWD as u64,
            path.as_ptr() as u64,
            flags as u64,
            mode as u64,
        )
    })
    .map(|fd| fd as i32)
}

pub const POLLIN: i16 = 0x0001;
pub const POLLOUT: i16 = 0x0004;
pub const POLLERR: i16 = 0x0008;
pub const POLLHUP: i16 = 0x0010;
pub const POLLNVAL: i16 = 0x0020;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    pub fd: i32,
    pub events: i16,
    pub revents: i16,
}

/// `ppoll` over `fds`. `None` blocks until an fd is ready.
pub fn ppoll(fds: &mut [PollFd], timeout_ms: Option<u64>) -> SysResult<usize> {
    let ret = match timeout_ms {
        Some(ms) => {
            // struct timespec { tv_sec, tv_nsec }
            let ts = [(ms / 1000) as i64, ((ms % 1000) * 1_000_000) as i64];
            unsafe {
                syscall5(SYS_PPOLL, fds.as_mut_ptr() as u64, fds.len() as u64, ts.as_ptr() as u64, 0, 0)
            }
        }
        None => unsafe { syscall5(SYS_PPOLL, fds.as_mut_ptr() as u64, fds.len() as u64, 0, 0, 0) },
    };
    check(ret)
}

pub const CLOCK_MONOTONIC: i32 = 1;

/// Monotonic clock in milliseconds.
pub fn monotonic_ms() -> u64 {
    let mut ts = [0i64; 2];
    let ret = unsafe { syscall2(SYS_CLOCK_GETTIME, CLOCK_MONOTONIC as u64, ts.as_mut_ptr() as u64) };
    if ret < 0 {
        return 0;
    }
    (ts[0] as u64) * 1000 + (ts[1] as u64) / 1_000_000
}

/// Fill `buf` from the kernel CSPRNG.
pub fn getrandom(buf: &mut [u8]) -> SysResult<()> {
    let mut off = 0usize;
    while off < buf.len() {
        let rest = &mut buf[off..];
        match check(unsafe { syscall3(SYS_GETRANDOM, rest.as_mut_ptr() as u64, rest.len() as u64, 0) }) {
            Ok(n) => off += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// Socket syscalls
pub const AF_INET: i32 = 2;
pub const SOCK_STREAM: i32 = 1;
pub const SOCK_NONBLOCK: i32 = 0o4000;
pub const SOCK_CLOEXEC: i32 = 0o2000000;

pub fn socket(domain: i32, type_: i32, protocol: i32) -> SysResult<i32> {
    check(unsafe { syscall3(SYS_SOCKET, domain as u64, type_ as u64, protocol as u64) })
        .map(|fd| fd as i32)
}

pub const SOL_SOCKET: i32 = 1;
pub const SO_REUSEADDR: i32 = 2;
pub const IPPROTO_TCP: i32 = 6;
pub const TCP_NODELAY: i32 = 1;

pub fn setsockopt_int(fd: i32, level: i32, optname: i32, value: i32) -> SysResult<()> {
    check(unsafe {
        syscall5(
            SYS_SETSOCKOPT,
            fd as u64,
            level as u64,
            optname as u64,
            (&value as *const i32) as u64,
            core::mem::size_of::<i32>() as u64,
        )
    })
    .map(|_| ())
}

/// IPv4 socket address in kernel layout; `sin_port` and `sin_addr` are in
/// network byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddrIn {
    pub sin_family: u16,
    pub sin_port: u16,
    pub sin_addr: u32,
    pub sin_zero: [u8; 8],
}

impl SockAddrIn {
    pub fn new(ip: [u8; 4], port: u16) -> Self {
        Self {
            sin_family: AF_INET as u16,
            sin_port: port.to_be(),
            sin_addr: u32::from_ne_bytes(ip),
            sin_zero: [0u8; 8],
        }
    }

    pub fn zeroed() -> Self {
        Self::new([0; 4], 0)
    }

    pub fn ip(&self) -> [u8; 4] {
        self.sin_addr.to_ne_bytes()
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.sin_port)
    }
}

const SOCKADDR_IN_LEN: usize = core::mem::size_of::<SockAddrIn>();

pub fn bind(fd: i32, addr: &SockAddrIn) -> SysResult<()> {
    check(unsafe { syscall3(SYS_BIND, fd as u64, addr as *const SockAddrIn as u64, SOCKADDR_IN_LEN as u64) })
        .map(|_| ())
}

pub fn listen(fd: i32, backlog: i32) -> SysResult<()> {
    check(unsafe { syscall2(SYS_LISTEN, fd as u64, backlog as u64) }).map(|_| ())
}

/// Accept one pending connection; the peer address is written to `peer`.
pub fn accept4(fd: i32, peer: &mut SockAddrIn, flags: i32) -> SysResult<i32> {
    let mut len: u32 = SOCKADDR_IN_LEN as u32;
    check(unsafe {
        syscall4(
            SYS_ACCEPT4,
            fd as u64,
            peer as *mut SockAddrIn as u64,
            &mut len as *mut u32 as u64,
            flags as u64,
        )
    })
    .map(|fd| fd as i32)
}

pub fn connect(fd: i32, addr: &SockAddrIn) -> SysResult<()> {
    check(unsafe {
        syscall3(SYS_CONNECT, fd as u64, addr as *const SockAddrIn as u64, SOCKADDR_IN_LEN as u64)
    })
    .map(|_| ())
}

pub const MSG_NOSIGNAL: i32 = 0x4000;

/// Send on a connected socket. `MSG_NOSIGNAL` is always set so a vanished
/// peer yields `EPIPE` instead of killing the process.
pub fn send(fd: i32, buf: &[u8]) -> SysResult<usize> {
    check(unsafe {
        syscall6(
            SYS_SENDTO,
            fd as u64,
            buf.as_ptr() as u64,
            buf.len() as u64,
            MSG_NOSIGNAL as u64,
            0,
            0,
        )
    })
}

pub fn recv(fd: i32, buf: &mut [u8]) -> SysResult<usize> {
    check(unsafe {
        syscall6(
            SYS_RECVFROM,
            fd as u64,
            buf.as_mut_ptr() as u64,
            buf.len() as u64,
            0,
            0,
            0,
        )
    })
}

pub const SHUT_RDWR: i32 = 2;

pub fn shutdown(fd: i32, how: i32) -> SysResult<()> {
    check(unsafe { syscall2(SYS_SHUTDOWN, fd as u64, how as u64) }).map(|_| ())
}

pub fn getsockname(fd: i32) -> SysResult<SockAddrIn> {
    let mut sa = SockAddrIn::zeroed();
    let mut len: u32 = SOCKADDR_IN_LEN as u32;
    check(unsafe {
        syscall3(
            SYS_GETSOCKNAME,
            fd as u64,
            &mut sa as *mut SockAddrIn as u64,
            &mut len as *mut u32 as u64,
        )
    })?;
    Ok(sa)
}

pub fn getpeername(fd: i32) -> SysResult<SockAddrIn> {
    let mut sa = SockAddrIn::zeroed();
    let mut len: u32 = SOCKADDR_IN_LEN as u32;
    check(unsafe {
        syscall3(
            SYS_GETPEERNAME,
            fd as u64,
            &mut sa as *mut SockAddrIn as u64,
            &mut len as *mut u32 as u64,
        )
    })?;
    Ok(sa)
}

// Utility: Format usize to decimal ASCII
#[inline]
pub fn format_usize(n: usize) -> ([u8; 20], usize) {
    let mut buf = [0u8; 20];
    if n == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    let mut num = n;
    let mut i = 0;
    while num > 0 {
        buf[i] = b'0' + (num % 10) as u8;
        num /= 10;
        i += 1;
    }
    buf[..i].reverse();
    (buf, i)
}

#[inline]
pub fn write_usize(fd: i32, n: usize) {
    let (buf, len) = format_usize(n);
    let _ = write(fd, &buf[..len]);
}
