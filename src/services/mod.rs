//! Background services

pub mod stale_reaper;

pub use stale_reaper::{StaleJobReaper, StaleJobReaperConfig, SweepReport};
