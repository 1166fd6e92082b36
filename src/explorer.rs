//! The fault-exploration engine (spec.md §4.4–§4.7, §5): enumerates
//! fault-model permutations, injects them under an oracle, and returns the
//! minimal set of exploitable [`crate::fault::FaultCombination`]s.

mod combinatorics;
mod injection;
mod simulator;

pub use simulator::{FaultSimulator, ModelMultiplicity, SimulationOutcome};

use std::ops::Range;

/// What the client's oracle decided at a halting point (spec.md §6
/// `Oracle::evaluate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Exploitable,
    NotExploitable,
    ContinueSimulation,
}

/// The client-supplied judge consulted at each halting point. Absent
/// (`Context::exploitability_model == None`) is defined as "always
/// exploitable at any halting point" (spec.md §6).
///
/// Implementations must be cheaply cloneable: each worker thread clones the
/// oracle on start and re-clones it before every fresh trial, so the oracle
/// cannot accumulate state across trials it did not intend to (spec.md §5
/// "Oracle cloning").
pub trait ExploitabilityModel: Send + Sync {
    fn evaluate(&self, emulator: &crate::emulator::Emulator, pc: u32) -> Verdict;

    fn clone_box(&self) -> Box<dyn ExploitabilityModel>;
}

impl Clone for Box<dyn ExploitabilityModel> {
    fn clone(&self) -> Box<dyn ExploitabilityModel> {
        self.clone_box()
    }
}

/// Exploration parameters shared by [`FaultSimulator`] and
/// [`crate::tracer::FaultTracer`] (spec.md §6 `Context`).
pub struct Context {
    /// PCs at which the oracle is consulted.
    pub halting_points: Vec<u32>,
    /// Absence means "always exploitable at any halting point".
    pub exploitability_model: Option<Box<dyn ExploitabilityModel>>,
    /// Per-trial instruction ceiling.
    pub emulation_timeout: u64,
    /// Half-open spans during which transient faults must not be injected.
    /// Does not suppress permanent faults.
    pub ignore_time_ranges: Vec<Range<u64>>,
    /// Half-open byte spans excluded from faultable-instruction enumeration
    /// and permanent-register-fault application points.
    pub ignore_memory_ranges: Vec<Range<u32>>,
}

impl Context {
    pub fn new(halting_points: Vec<u32>, emulation_timeout: u64) -> Context {
        Context {
            halting_points,
            exploitability_model: None,
            emulation_timeout,
            ignore_time_ranges: Vec::new(),
            ignore_memory_ranges: Vec::new(),
        }
    }

    /// Small explicit constructors in the teacher's `Emulator::new(arch)`
    /// spirit, rather than a general-purpose builder type.
    pub fn with_exploitability_model(mut self, model: Box<dyn ExploitabilityModel>) -> Context {
        self.exploitability_model = Some(model);
        self
    }

    pub fn with_ignore_time_ranges(mut self, ranges: Vec<Range<u64>>) -> Context {
        self.ignore_time_ranges = ranges;
        self
    }

    pub fn with_ignore_memory_ranges(mut self, ranges: Vec<Range<u32>>) -> Context {
        self.ignore_memory_ranges = ranges;
        self
    }

    /// The "configuration errors" bucket of spec.md §7, checked once at
    /// [`FaultSimulator::new`] construction rather than on every trial.
    pub(crate) fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if self.emulation_timeout == 0 {
            return Err(crate::error::ConfigError::NoEmulationTimeout);
        }
        if self.halting_points.is_empty() {
            return Err(crate::error::ConfigError::NoHaltingPoints);
        }
        Ok(())
    }

    fn in_ignored_memory(&self, address: u32) -> bool {
        self.ignore_memory_ranges.iter().any(|r| r.contains(&address))
    }

    fn in_ignored_time(&self, time: u64) -> bool {
        self.ignore_time_ranges.iter().any(|r| r.contains(&time))
    }

    /// Sorted binary search on `halting_points`, used by the explorer
    /// (spec.md §9 Open Questions: the tracer deliberately uses linear scan
    /// on the caller's unsorted list instead, preserving the source's
    /// documented divergence rather than unifying the two).
    fn is_halting_point_sorted(sorted_points: &[u32], pc: u32) -> bool {
        sorted_points.binary_search(&pc).is_ok()
    }

    fn evaluate(&self, emulator: &crate::emulator::Emulator, pc: u32) -> Verdict {
        match &self.exploitability_model {
            Some(model) => model.evaluate(emulator, pc),
            None => Verdict::Exploitable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_oracle_is_always_exploitable() {
        let ctx = Context::new(vec![0x100], 10);
        let flash = crate::emulator::MemoryRegion::flash(0x0800_0000, 0x10);
        let ram = crate::emulator::MemoryRegion::ram(0x2000_0000, 0x10);
        let emu = crate::emulator::Emulator::new(crate::arch::Architecture::ARMv7M, flash, ram);
        assert_eq!(ctx.evaluate(&emu, 0x100), Verdict::Exploitable);
    }

    #[test]
    fn ignore_ranges_are_half_open() {
        let mut ctx = Context::new(vec![0x100], 10);
        ctx.ignore_memory_ranges.push(0x1000..0x1010);
        assert!(ctx.in_ignored_memory(0x1000));
        assert!(!ctx.in_ignored_memory(0x1010));
    }
}
