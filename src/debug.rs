use std::sync::atomic;

/// Diagnostic output level. 0 is silent, 1 enables `debug!` (per-stream and
/// per-block progress), 2 also enables `trace!` (every executed instruction).
/// Messages go to stderr.
pub static VERBOSITY: atomic::AtomicU8 = atomic::AtomicU8::new(0);

pub fn set_verbosity(level: u8) {
    VERBOSITY.store(level, atomic::Ordering::Relaxed);
}

pub fn enabled(level: u8) -> bool {
    VERBOSITY.load(atomic::Ordering::Relaxed) >= level
}

macro_rules! debug {
    ($($x:tt)*) => {
        if crate::debug::enabled(1) {
            eprintln!($($x)*);
        }
    }
}

macro_rules! trace {
    ($($x:tt)*) => {
        if crate::debug::enabled(2) {
            eprintln!($($x)*);
        }
    }
}
