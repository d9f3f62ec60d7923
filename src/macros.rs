// Logging shims.
//
// An allocator cannot assume the installed logger does not allocate, so
// logging is opt-in through the `logging` feature. Without it the arguments are
// still type-checked but nothing is emitted.

macro_rules! trace {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        {
            log::trace!($($arg)*);
        }
        #[cfg(not(feature = "logging"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}

macro_rules! debug {
    ($($arg:tt)*) => {{
        #[cfg(feature = "logging")]
        {
            log::debug!($($arg)*);
        }
        #[cfg(not(feature = "logging"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}
