//! Group packer (spec.md §4.E): per-group selection loop that drives
//! containers from candidate file records through to a sealed archive.

pub mod clock;
pub mod tick;

pub use clock::{Clock, SystemClock};
pub use tick::{run_group_tick, GroupTickOutcome};
