//! Process entry: `_start`, argv collection and the panic handler

use alloc::vec::Vec;
use bridge_runtime::log_write;
use bridge_runtime::logger::LineBuf;
use bridge_syscall as sys;
use core::ffi::{CStr, c_char};
use core::fmt::Write;
use core::panic::PanicInfo;

// Kernel leaves argc at [rsp] and argv right above it.
core::arch::global_asm!(
    ".globl _start",
    "_start:",
    "pop rdi",
    "mov rsi, rsp",
    "and rsp, -16",
    "xor rbp, rbp",
    "call {entry}",
    "ud2",
    entry = sym entry,
);

unsafe extern "C" fn entry(argc: usize, argv: *const *const c_char) -> ! {
    let mut args: Vec<&'static str> = Vec::with_capacity(argc.saturating_sub(1));
    for i in 1..argc {
        // SAFETY: the kernel guarantees `argc` valid NUL-terminated pointers.
        let arg = unsafe {
            let p = *argv.add(i);
            if p.is_null() {
                break;
            }
            CStr::from_ptr(p)
        };
        args.push(arg.to_str().unwrap_or(""));
    }
    sys::exit(crate::main(&args))
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut line = LineBuf::new();
    let _ = write!(line, "[PANIC] {}", info);
    line.finish();
    log_write(line.as_bytes());
    sys::exit(101)
}
