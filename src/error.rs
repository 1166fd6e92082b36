//! Ambient error types (SPEC_FULL.md §1.2).
//!
//! `ReturnCode` (spec.md §4.1) is deliberately *not* here: it is a normal
//! value returned from `Emulator::emulate`, not an error, since faulted
//! execution is an expected outcome of fault injection (spec.md §7).

use std::fmt;

/// Configuration errors (spec.md §7): missing timeout, halting points,
/// memory regions, or entry point. Surfaced at construction time and meant
/// to abort the run, never produced mid-exploration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoEmulationTimeout,
    NoHaltingPoints,
    FlashRegionNotSet,
    RamRegionNotSet,
    NoEntryPoint,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoEmulationTimeout => write!(f, "no emulation timeout specified"),
            ConfigError::NoHaltingPoints => write!(f, "no halting points specified"),
            ConfigError::FlashRegionNotSet => write!(f, "flash region not set"),
            ConfigError::RamRegionNotSet => write!(f, "RAM region not set"),
            ConfigError::NoEntryPoint => write!(f, "no entry point (PC) configured"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// A memory or register access from client code (not from the executor
/// itself) that is plainly invalid (spec.md §4.1 "Failure semantics").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccessError {
    OutOfBounds { address: u32, len: u32 },
    NotReadable { address: u32 },
    NotWritable { address: u32 },
}

impl fmt::Display for MemoryAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryAccessError::OutOfBounds { address, len } => {
                write!(f, "access of {len} bytes at {address:#010x} is out of bounds")
            }
            MemoryAccessError::NotReadable { address } => {
                write!(f, "address {address:#010x} is not readable")
            }
            MemoryAccessError::NotWritable { address } => {
                write!(f, "address {address:#010x} is not writable")
            }
        }
    }
}

impl std::error::Error for MemoryAccessError {}

/// An impossible outcome inside the explorer (spec.md §7 "Invariant
/// violations"), e.g. `emulate(end_address, _)` returning anything other
/// than `END_ADDRESS_REACHED`/`MAX_INSTRUCTIONS_REACHED`. These indicate a
/// bug in the explorer itself, not a faulted program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorerError(pub String);

impl fmt::Display for ExplorerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault explorer invariant violated: {}", self.0)
    }
}

impl std::error::Error for ExplorerError {}
