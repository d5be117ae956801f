//! Shared utilities: tick sources and memory regions

pub mod fast_time;
pub mod region;
