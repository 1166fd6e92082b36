//! `FaultCombination`: an insertion-ordered multiset of faults with a
//! lazily-rebuilt sorted view (spec.md §4.3), grounded on
//! `examples/original_source/subprojects/armory/include/armory/fault_combination.h`
//! and `.../src/fault_combination.cpp`.

use super::{InstructionFault, RegisterFault};
use std::hash::{Hash, Hasher};

/// `boost::hash_combine`-equivalent mixing step, used so the combined hash
/// depends on order the way the original's `hash_combine` loop does.
fn hash_combine<T: Hash>(seed: &mut u64, value: &T) {
    let mut hasher = rustc_hash::FxHasher::default();
    value.hash(&mut hasher);
    let h = hasher.finish();
    *seed ^= h.wrapping_add(0x9e37_79b9_7f4a_7c15).wrapping_add(*seed << 6).wrapping_add(*seed >> 2);
}

/// A set of faults injected together into one emulation run.
///
/// Faults are stored in insertion order (the order the explorer injected
/// them), which is what `==` compares by: two combinations with the same
/// faults in a different order are *not* equal, matching spec.md §4.3's
/// "order-sensitive equality". A sorted view is cached for `includes` and
/// rebuilt only when the cache's length no longer matches the live vectors
/// (cheap staleness check rather than a dirty flag to invalidate on every
/// mutation path).
#[derive(Debug, Clone, Default)]
pub struct FaultCombination {
    instruction_faults: Vec<InstructionFault>,
    register_faults: Vec<RegisterFault>,
    sorted_cache: std::cell::RefCell<Option<(Vec<InstructionFault>, Vec<RegisterFault>)>>,
}

impl FaultCombination {
    pub fn new() -> FaultCombination {
        FaultCombination { instruction_faults: Vec::new(), register_faults: Vec::new(), sorted_cache: std::cell::RefCell::new(None) }
    }

    pub fn push_instruction_fault(&mut self, fault: InstructionFault) {
        self.instruction_faults.push(fault);
    }

    pub fn push_register_fault(&mut self, fault: RegisterFault) {
        self.register_faults.push(fault);
    }

    pub fn instruction_faults(&self) -> &[InstructionFault] {
        &self.instruction_faults
    }

    pub fn register_faults(&self) -> &[RegisterFault] {
        &self.register_faults
    }

    pub fn len(&self) -> usize {
        self.instruction_faults.len() + self.register_faults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sorted_view(&self) -> std::cell::Ref<'_, (Vec<InstructionFault>, Vec<RegisterFault>)> {
        let needs_rebuild = {
            let cache = self.sorted_cache.borrow();
            match &*cache {
                Some((i, r)) => i.len() != self.instruction_faults.len() || r.len() != self.register_faults.len(),
                None => true,
            }
        };
        if needs_rebuild {
            let mut instr = self.instruction_faults.clone();
            instr.sort();
            let mut regs = self.register_faults.clone();
            regs.sort();
            *self.sorted_cache.borrow_mut() = Some((instr, regs));
        }
        std::cell::Ref::map(self.sorted_cache.borrow(), |c| c.as_ref().unwrap())
    }

    /// Multiset-subsequence test (spec.md §4.3 `includes`): does `self`
    /// contain every fault in `other`, counting multiplicity, regardless
    /// of order? Used by the explorer's redundancy pruning to test whether
    /// an already-known-exploitable combination is a subset of the one
    /// about to be explored.
    pub fn includes(&self, other: &FaultCombination) -> bool {
        let self_sorted = self.sorted_view();
        let other_sorted = other.sorted_view();
        is_multiset_subset(&self_sorted.0, &other_sorted.0) && is_multiset_subset(&self_sorted.1, &other_sorted.1)
    }
}

fn is_multiset_subset<T: Ord + Copy>(haystack_sorted: &[T], needle_sorted: &[T]) -> bool {
    let mut h = haystack_sorted.iter().peekable();
    for n in needle_sorted {
        loop {
            match h.peek() {
                None => return false,
                Some(&&x) if x == *n => {
                    h.next();
                    break;
                }
                Some(&&x) if x < *n => {
                    h.next();
                }
                _ => return false,
            }
        }
    }
    true
}

impl PartialEq for FaultCombination {
    fn eq(&self, other: &Self) -> bool {
        self.instruction_faults == other.instruction_faults && self.register_faults == other.register_faults
    }
}
impl Eq for FaultCombination {}

impl Hash for FaultCombination {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut seed = 0u64;
        for f in &self.instruction_faults {
            hash_combine(&mut seed, f);
        }
        for f in &self.register_faults {
            hash_combine(&mut seed, f);
        }
        seed.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(time: u64, address: u32) -> InstructionFault {
        InstructionFault { time, address, fault_model_iteration: 0, model_index: 0 }
    }

    #[test]
    fn equality_is_order_sensitive() {
        let mut a = FaultCombination::new();
        a.push_instruction_fault(instr(0, 0x1000));
        a.push_instruction_fault(instr(1, 0x1004));

        let mut b = FaultCombination::new();
        b.push_instruction_fault(instr(1, 0x1004));
        b.push_instruction_fault(instr(0, 0x1000));

        assert_ne!(a, b);
    }

    #[test]
    fn includes_ignores_order() {
        let mut big = FaultCombination::new();
        big.push_instruction_fault(instr(1, 0x1004));
        big.push_instruction_fault(instr(0, 0x1000));
        big.push_instruction_fault(instr(2, 0x1008));

        let mut small = FaultCombination::new();
        small.push_instruction_fault(instr(0, 0x1000));
        small.push_instruction_fault(instr(2, 0x1008));

        assert!(big.includes(&small));
        assert!(!small.includes(&big));
    }

    #[test]
    fn includes_respects_multiplicity() {
        let mut one = FaultCombination::new();
        one.push_instruction_fault(instr(0, 0x1000));

        let mut two = FaultCombination::new();
        two.push_instruction_fault(instr(0, 0x1000));
        two.push_instruction_fault(instr(0, 0x1000));

        assert!(!one.includes(&two));
        assert!(two.includes(&one));
    }
}
