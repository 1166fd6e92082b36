#![warn(clippy::all, rust_2018_idioms)]

//! A cycle-stepped ARMv6-M/ARMv7-M Thumb emulator, an incremental
//! snapshot/restore engine, and a fault-exploration engine that enumerates
//! fault-model permutations against a firmware image under a
//! client-supplied exploitability oracle.
//!
//! [`emulator`] is the execution core, [`snapshot`] is the scoped
//! backup/restore guard the explorer and tracer build on, [`fault`]
//! describes what a fault is and how combinations of them compare,
//! [`explorer`] drives the combinatorial search, and [`tracer`] replays one
//! already-known combination for diagnostics.

pub mod arch;
pub mod decoder;
pub mod emulator;
pub mod error;
pub mod explorer;
pub mod fault;
pub mod snapshot;
pub mod tracer;

pub use emulator::{CpuState, Emulator, MemoryRegion, ReturnCode};
pub use explorer::{Context, ExploitabilityModel, FaultSimulator, SimulationOutcome, Verdict};
pub use fault::{FaultCombination, FaultModel};
pub use snapshot::Snapshot;
