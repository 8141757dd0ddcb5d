use std::io::{self, Write};

use lazy_static::lazy_static;
use spin::Mutex;

/// Shared diagnostic sink. Everything the scheduler reports goes to
/// stderr so a driver's stdout stays clean for its own output.
pub struct Sink {
    out: io::Stderr,
}

impl Sink {
    fn new() -> Sink {
        Sink { out: io::stderr() }
    }
}

impl core::fmt::Write for Sink {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.out.write_all(s.as_bytes()).map_err(|_| core::fmt::Error)
    }
}

lazy_static! {
    pub static ref SINK: Mutex<Sink> = Mutex::new(Sink::new());
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;
    // A failed write is not worth killing the simulation over.
    let _ = SINK.lock().write_fmt(args);
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::log::_print(format_args!("[INFO] "));
        $crate::log::_print(format_args!($($arg)*));
        $crate::log::_print(format_args!("\n"));
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log::_print(format_args!("[WARN] "));
        $crate::log::_print(format_args!($($arg)*));
        $crate::log::_print(format_args!("\n"));
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log::_print(format_args!("[ERROR] "));
        $crate::log::_print(format_args!($($arg)*));
        $crate::log::_print(format_args!("\n"));
    };
}
