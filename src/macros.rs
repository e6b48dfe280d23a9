//! Logging
//!
//! `hub_*!` take defmt style format strings. With `defmt-logging` they log
//! at the matching defmt level, otherwise the arguments are only borrowed
//! so that nothing is reported as unused.

#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! hub_log {
    ($level:ident, $($arg:expr),+ $(,)?) => { defmt::$level!($($arg),+) };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! hub_log {
    ($level:ident, $($arg:expr),+ $(,)?) => {{ $( let _ = &$arg; )+ }};
}

macro_rules! hub_trace {
    ($($arg:expr),+ $(,)?) => (hub_log!(trace, $($arg),+));
}

macro_rules! hub_debug {
    ($($arg:expr),+ $(,)?) => (hub_log!(debug, $($arg),+));
}

macro_rules! hub_info {
    ($($arg:expr),+ $(,)?) => (hub_log!(info, $($arg),+));
}

macro_rules! hub_warn {
    ($($arg:expr),+ $(,)?) => (hub_log!(warn, $($arg),+));
}

macro_rules! hub_error {
    ($($arg:expr),+ $(,)?) => (hub_log!(error, $($arg),+));
}
