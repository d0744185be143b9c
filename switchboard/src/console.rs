//! Console - where state dumps are spoken
//!
//! The kernel embedding this crate installs a [`ConsoleSink`] once it has
//! somewhere to write (VGA text buffer, serial port). Until then output is
//! dropped.

use core::fmt;
use spin::{Mutex, Once};

/// Destination of console output.
pub trait ConsoleSink: Sync {
    fn write_str(&self, s: &str);
}

static SINK: Once<&'static dyn ConsoleSink> = Once::new();
static CONSOLE: Mutex<Console> = Mutex::new(Console);

struct Console;

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if let Some(sink) = SINK.get() {
            sink.write_str(s);
        }
        Ok(())
    }
}

/// Install the console sink. Only the first call has an effect.
pub fn install(sink: &'static dyn ConsoleSink) {
    SINK.call_once(|| sink);
}

#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    // One call, one lock hold: dumps from different CPUs never interleave.
    crate::attunement::without_interrupts(|| {
        let _ = CONSOLE.lock().write_fmt(args);
    });
}
