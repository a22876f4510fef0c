//! Scheduler probes.

pub mod runqueue;
