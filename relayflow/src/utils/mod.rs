//! Utility functions for UUID generation, timestamps and clocks.

pub mod timestamps;
mod uuid_utils;

pub use timestamps::{
    ceil_secs, duration_between, format_iso8601, iso_timestamp, now_utc, system_clock, to_chrono,
    Clock, ManualClock, SystemClock, Timestamp,
};
pub use uuid_utils::{generate_uuid, generate_uuid_v7};
