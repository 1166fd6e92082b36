//! Incremental RAM snapshot/restore (spec.md §4.2).
//!
//! A [`Snapshot`] borrows an [`Emulator`] for its lifetime and tracks which
//! bytes of RAM have been written since the last `backup`/`restore`, split
//! into two disjoint windows around the stack pointer observed at
//! construction time. The split exists because stack-heavy fault runs
//! dirty a tight, fast-moving region around SP while globals/the heap
//! dirty a much wider, slower-moving region; tracking them as one interval
//! would force a full-RAM copy on every backup once both have been
//! touched once.

use crate::emulator::{CpuState, Emulator, HookId};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// Bytes below `construction_sp - WINDOW_SPLIT_BYTES` track as the "low"
/// window; everything else tracks as "high" (spec.md §4.2).
const WINDOW_SPLIT_BYTES: u32 = 80;

#[derive(Debug, Clone, Copy)]
struct DirtyRange {
    low: u32,
    high: u32,
}

impl DirtyRange {
    fn touch(range: &mut Option<DirtyRange>, address: u32, len: u32) {
        let end = address.wrapping_add(len);
        *range = Some(match range {
            Some(r) => DirtyRange { low: r.low.min(address), high: r.high.max(end) },
            None => DirtyRange { low: address, high: end },
        });
    }
}

enum Backing {
    /// No backup taken yet, or the last operation was a `reset`: the next
    /// `backup` must copy the whole region rather than trust dirty tracking.
    None,
    /// A full copy of RAM, taken because this was the first backup since
    /// construction or since the last `reset` (spec.md §4.2).
    Full(Vec<u8>),
    /// An incremental copy of just the previously dirtied windows.
    Windows { low: Option<(u32, Vec<u8>)>, high: Option<(u32, Vec<u8>)> },
}

/// A scoped snapshot guard (spec.md §9: "model this with a scoped guard
/// rather than a shared owner" — no cyclic `Emulator`/`Snapshot` references).
pub struct Snapshot<'a> {
    emulator: &'a mut Emulator,
    hook_id: HookId,
    split: u32,
    dirty_low: Rc<RefCell<Option<DirtyRange>>>,
    dirty_high: Rc<RefCell<Option<DirtyRange>>>,
    backing: Backing,
    cpu_backup: Option<CpuState>,
}

impl<'a> Snapshot<'a> {
    pub fn new(emulator: &'a mut Emulator) -> Snapshot<'a> {
        let split = emulator.cpu.registers.read(crate::arch::Register::SP).wrapping_sub(WINDOW_SPLIT_BYTES);
        let dirty_low = Rc::new(RefCell::new(None::<DirtyRange>));
        let dirty_high = Rc::new(RefCell::new(None::<DirtyRange>));
        let low_for_hook = dirty_low.clone();
        let high_for_hook = dirty_high.clone();
        let hook_id = emulator.after_memory_write_hooks.register(move |(address, len)| {
            if address < split {
                DirtyRange::touch(&mut *low_for_hook.borrow_mut(), address, len);
            } else {
                DirtyRange::touch(&mut *high_for_hook.borrow_mut(), address, len);
            }
        });
        Snapshot { emulator, hook_id, split, dirty_low, dirty_high, backing: Backing::None, cpu_backup: None }
    }

    /// Save `CPUState` plus the current dirty windows (or all of RAM, the
    /// first time or right after a `reset`), then mark RAM as clean.
    pub fn backup(&mut self) {
        self.cpu_backup = Some(self.emulator.cpu);
        match &self.backing {
            Backing::None => {
                trace!(ram_len = self.emulator.ram.len(), "snapshot: full backup");
                self.backing = Backing::Full(self.emulator.ram.raw().to_vec());
            }
            _ => {
                let low = self.window_copy(*self.dirty_low.borrow());
                let high = self.window_copy(*self.dirty_high.borrow());
                trace!("snapshot: incremental backup");
                self.backing = Backing::Windows { low, high };
            }
        }
        self.clear_dirty();
    }

    fn window_copy(&self, range: Option<DirtyRange>) -> Option<(u32, Vec<u8>)> {
        range.map(|r| {
            let len = r.high - r.low;
            let bytes = self.emulator.ram.read_bytes(r.low, len).expect("dirty range is within RAM");
            (r.low, bytes.to_vec())
        })
    }

    /// Write `CPUState` and the saved bytes back into RAM, undoing
    /// everything mutated since the last `backup`.
    pub fn restore(&mut self) {
        if let Some(cpu) = self.cpu_backup {
            self.emulator.cpu = cpu;
        }
        match &self.backing {
            Backing::None => {}
            Backing::Full(bytes) => {
                let base = self.emulator.ram.base();
                self.emulator.ram.write_bytes(base, bytes).expect("full backup matches RAM size");
            }
            Backing::Windows { low, high } => {
                if let Some((address, bytes)) = low {
                    self.emulator.ram.write_bytes(*address, bytes).expect("window stays in RAM");
                }
                if let Some((address, bytes)) = high {
                    self.emulator.ram.write_bytes(*address, bytes).expect("window stays in RAM");
                }
            }
        }
        self.clear_dirty();
    }

    /// Forget all tracked state: the next `backup` takes a full copy again
    /// (spec.md §4.2 — used after the caller resets RAM to its power-on
    /// image out-of-band).
    pub fn reset(&mut self) {
        self.backing = Backing::None;
        self.clear_dirty();
    }

    fn clear_dirty(&mut self) {
        *self.dirty_low.borrow_mut() = None;
        *self.dirty_high.borrow_mut() = None;
    }

    pub fn split_address(&self) -> u32 {
        self.split
    }

    /// Access the borrowed emulator. Exposed so the fault explorer/tracer
    /// can drive execution and patch memory through the same borrow the
    /// snapshot is tracking writes on (spec.md §4.5/§4.6 call `backup`,
    /// `restore`, and ordinary emulator operations interleaved).
    pub fn emulator_mut(&mut self) -> &mut Emulator {
        self.emulator
    }

    pub fn emulator(&self) -> &Emulator {
        self.emulator
    }
}

impl Drop for Snapshot<'_> {
    fn drop(&mut self) {
        self.emulator.after_memory_write_hooks.remove(self.hook_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Architecture, Register};
    use crate::emulator::MemoryRegion;

    fn emulator() -> Emulator {
        let flash = MemoryRegion::flash(0x0800_0000, 0x100);
        let ram = MemoryRegion::ram(0x2000_0000, 0x1000);
        let mut e = Emulator::new(Architecture::ARMv7M, flash, ram);
        e.cpu.registers.write(Register::SP, 0x2000_0800);
        e
    }

    #[test]
    fn restore_undoes_writes_since_backup() {
        let mut e = emulator();
        {
            let mut snap = Snapshot::new(&mut e);
            snap.backup();
            snap.emulator.write_memory(0x2000_0010, &[1, 2, 3, 4]).unwrap();
            snap.restore();
        }
        assert_eq!(e.ram.read_u32(0x2000_0010).unwrap(), 0);
    }

    #[test]
    fn reset_forces_a_full_backup_next_time() {
        let mut e = emulator();
        let mut snap = Snapshot::new(&mut e);
        snap.backup();
        snap.emulator.write_memory(0x2000_0010, &[1, 2, 3, 4]).unwrap();
        snap.backup();
        assert!(matches!(snap.backing, Backing::Windows { .. }));
        snap.reset();
        snap.backup();
        assert!(matches!(snap.backing, Backing::Full(_)));
    }
}
