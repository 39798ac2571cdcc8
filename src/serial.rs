//! Serial console and the paging diagnostic stream.
//!
//! The paging core reports one line per significant event (`PAGEFAULT`,
//! `SWAPOUT`, `RESIDENT`, `KILL`, ...) through the [`diag!`] macro, which
//! tags each line with the owning process id:
//!
//! ```text
//! [pid 3] SWAPOUT va=0x403000 slot=0
//! ```
//!
//! Those lines leave QEMU on COM1, so the test harness can watch the core
//! work without reaching into kernel memory.

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts;

/// I/O base of the first UART.
const COM1_BASE: u16 = 0x3F8;

lazy_static! {
    /// The first serial port, shared behind a spinlock.
    pub static ref COM1: Mutex<SerialPort> = {
        // SAFETY:
        // COM1_BASE is the standard data port of the first UART.
        let mut port = unsafe { SerialPort::new(COM1_BASE) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    use core::fmt::Write;

    // Fault and syscall handlers log through this path; keep an interrupt
    // from re-entering while the port lock is held.
    interrupts::without_interrupts(|| {
        #[expect(
            clippy::expect_used,
            reason = "The UART cannot fail once it is initialized."
        )]
        COM1.lock()
            .write_fmt(args)
            .expect("Failed to print on serial port.");
    });
}

/// Print to host machine through serial port interface.
#[macro_export]
macro_rules! serial_print {
    ($($args:tt)*) => {
        $crate::serial::_print(format_args!($($args)*));
    };
}

/// Print to host machine through serial port interface a line.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($fmt:expr) => ($crate::serial_print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => ($crate::serial_print!(
        concat!($fmt, "\n"), $($arg)*));
}

/// Emit one paging diagnostic line, tagged with the owning process id.
///
/// The tag vocabulary (`PAGEFAULT`, `LOADEXEC`, `ALLOC`, `SWAPIN`,
/// `RESIDENT`, `VICTIM`, `EVICT`, `DISCARD`, `SWAPOUT`, `MEMFULL`,
/// `SWAPFULL`, `SWAPCLEANUP`, `KILL`) is part of the kernel's observable
/// behaviour; tests match on these lines.
#[macro_export]
macro_rules! diag {
    ($pid:expr, $fmt:expr) => {
        $crate::serial_println!(concat!("[pid {}] ", $fmt), $pid);
    };
    ($pid:expr, $fmt:expr, $($arg:tt)*) => {
        $crate::serial_println!(concat!("[pid {}] ", $fmt), $pid, $($arg)*);
    };
}
