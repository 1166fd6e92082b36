//! `FaultSimulator`: the public entry point for fault exploration
//! (spec.md §4.4, §5), grounded on
//! `examples/original_source/subprojects/armory/src/fault_simulator.cpp`
//! and `include/armory/fault_simulator.h`.

use super::combinatorics::permutations_of;
use super::injection::{faultable_instruction_table, simulate_fault, Trial};
use super::Context;
use crate::emulator::Emulator;
use crate::fault::{FaultCombination, FaultModel};
use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// A model entry plus how many times it may recur within one combination
/// (spec.md §4.4 `models_with_multiplicity`).
pub struct ModelMultiplicity {
    pub model: FaultModel,
    pub multiplicity: usize,
}

/// The result of [`FaultSimulator::simulate_faults`]: the de-duplicated,
/// minimal set of exploitable combinations plus how many permutations were
/// explored (spec.md §8 property 5 "minimality").
#[derive(Debug)]
pub struct SimulationOutcome {
    pub combinations: Vec<FaultCombination>,
    pub permutations_explored: usize,
}

/// Drives the search: owns the model list, the shared [`Context`], and the
/// thread-pool configuration (spec.md §6 `FaultSimulator(Context)`).
pub struct FaultSimulator {
    context: Context,
    num_threads: usize,
    print_progress: bool,
}

impl FaultSimulator {
    /// spec.md §7: configuration errors are "surfaced at simulator
    /// construction", not buried inside `simulate_faults`.
    pub fn new(context: Context) -> Result<FaultSimulator, crate::error::ConfigError> {
        context.validate()?;
        let default_threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Ok(FaultSimulator { context, num_threads: default_threads, print_progress: false })
    }

    pub fn set_number_of_threads(&mut self, n: usize) {
        self.num_threads = n.max(1);
    }

    pub fn enable_progress_printing(&mut self, enabled: bool) {
        self.print_progress = enabled;
    }

    /// spec.md §4.4 `simulate_faults`. `max_simultaneous_k` bounds the size
    /// of any single combination explored (`K` throughout spec.md §4.4–§4.7).
    pub fn simulate_faults(&self, base_emulator: &Emulator, models_with_multiplicity: Vec<ModelMultiplicity>, max_simultaneous_k: usize) -> SimulationOutcome {
        let (models, multiplicities) = order_instruction_models_first(models_with_multiplicity);
        // Dedup while preserving first-seen order (spec.md §8 property 7
        // determinism), then sort for the explorer's binary-search lookup.
        let deduped_halting_points: IndexSet<u32> = self.context.halting_points.iter().copied().collect();
        let mut sorted_halting_points: Vec<u32> = deduped_halting_points.into_iter().collect();
        sorted_halting_points.sort_unstable();

        let permutations = compute_model_combinations(&models, &multiplicities, max_simultaneous_k);
        info!(count = permutations.len(), "fault exploration: permutations to examine");

        // Memoization per spec.md §4.4 "Main loop": combinations already
        // known-exploitable, keyed by the permutation (as a Vec<usize>)
        // that produced them.
        let mut memo: FxHashMap<Vec<usize>, Vec<FaultCombination>> = FxHashMap::default();
        let mut results: Vec<FaultCombination> = Vec::new();

        for permutation in &permutations {
            let known = collect_known_redundant_hashes(permutation, &memo);
            let known_hashes = Arc::new(Mutex::new(known));

            let progress = Arc::new(Mutex::new(0usize));
            let new_faults: Arc<Mutex<Vec<FaultCombination>>> = Arc::new(Mutex::new(Vec::new()));
            let faultable_sites = faultable_instruction_table(base_emulator, &self.context);
            let num_outer = faultable_sites.len().max(1);

            // Each worker owns its own `Emulator` clone up front (spec.md
            // §5 "no emulator or snapshot crosses threads"): `Emulator`
            // holds boxed hook closures that are not `Sync`, so a shared
            // `&Emulator` could never cross into `scope.spawn` anyway —
            // forking here and moving the owned fork into each thread is
            // both the spec's model and the only one the borrow checker
            // accepts.
            let worker_emulators: Vec<Emulator> = (0..self.num_threads).map(|_| base_emulator.fork()).collect();

            std::thread::scope(|scope| {
                for mut worker_emulator in worker_emulators {
                    let progress = Arc::clone(&progress);
                    let new_faults = Arc::clone(&new_faults);
                    let known_hashes = Arc::clone(&known_hashes);
                    let models = &models;
                    let permutation = permutation.as_slice();
                    let sorted_halting_points = &sorted_halting_points;
                    let ctx = &self.context;
                    let print_progress = self.print_progress;
                    scope.spawn(move || {
                        let trial = Trial { models, permutation, ctx, sorted_halting_points };
                        let mut local_new_faults = Vec::new();

                        loop {
                            let index = {
                                let mut guard = progress.lock().unwrap();
                                if *guard >= num_outer {
                                    break;
                                }
                                let i = *guard;
                                *guard += 1;
                                if print_progress {
                                    debug!(index = i, total = num_outer, "fault exploration progress");
                                }
                                i
                            };
                            let _ = index;

                            let mut is_redundant = |candidate: &FaultCombination| is_fault_redundant(candidate, &known_hashes);
                            let chain = FaultCombination::new();
                            simulate_fault(&mut worker_emulator, &trial, 0, ctx.emulation_timeout, &chain, &mut local_new_faults, &mut is_redundant);
                        }

                        new_faults.lock().unwrap().extend(local_new_faults);
                    });
                }
            });

            let mut this_permutation_faults = Arc::try_unwrap(new_faults).unwrap().into_inner().unwrap();
            this_permutation_faults.sort_by(|a, b| a.len().cmp(&b.len()));
            this_permutation_faults.dedup_by(|a, b| a == b);

            for c in &this_permutation_faults {
                if !results.iter().any(|r: &FaultCombination| r.includes(c) || r == c) {
                    results.push(c.clone());
                }
            }
            memo.insert(permutation.clone(), this_permutation_faults);
        }

        let minimal_snapshot = results.clone();
        results.retain(|candidate| !minimal_snapshot.iter().any(|other| other != candidate && other.len() < candidate.len() && candidate.includes(other)));
        results.sort_by(|a, b| a.len().cmp(&b.len()));

        SimulationOutcome { combinations: results, permutations_explored: permutations.len() }
    }
}

/// Sorts so instruction-fault models precede register-fault models while
/// preserving relative order otherwise (spec.md §4.4 preprocessing step
/// 1), and returns each model alongside its multiplicity: how many times
/// its index may repeat within one combination's index-multiset (spec.md
/// §4.4 step 4). Multiplicity is tracked as a sibling array rather than by
/// duplicating the model object itself, since `FaultModel`'s boxed
/// closures are not `Clone`.
fn order_instruction_models_first(models: Vec<ModelMultiplicity>) -> (Vec<FaultModel>, Vec<usize>) {
    let mut instruction: Vec<(FaultModel, usize)> = Vec::new();
    let mut register: Vec<(FaultModel, usize)> = Vec::new();
    for entry in models {
        let ModelMultiplicity { model, multiplicity } = entry;
        if matches!(model, FaultModel::Instruction(_)) {
            instruction.push((model, multiplicity));
        } else {
            register.push((model, multiplicity));
        }
    }
    instruction.extend(register);
    instruction.into_iter().unzip()
}

/// spec.md §4.4 step 4 `compute_model_combinations`. Builds an
/// index-multiset over `models` (each index repeated by its
/// `multiplicities` entry), splitting permanent vs. non-permanent
/// lifetimes, enumerating subsets of permanents (order irrelevant) and
/// permutations of non-permanents (order matters), optionally prefixed by
/// a permanent subset, then dedupes and sorts by `(size, lexicographic)`.
fn compute_model_combinations(models: &[FaultModel], multiplicities: &[usize], k: usize) -> Vec<Vec<usize>> {
    let indices: Vec<usize> = (0..models.len()).flat_map(|i| std::iter::repeat(i).take(multiplicities[i].max(1))).collect();
    let (permanent, non_permanent): (Vec<usize>, Vec<usize>) = indices.into_iter().partition(|&i| is_permanent(&models[i]));

    let permanent_subsets: Vec<Vec<usize>> = {
        let max_size = permanent.len().min(k);
        (1..=max_size).flat_map(|size| super::combinatorics::subsets_of_size(&permanent, size)).collect()
    };

    let mut combined: Vec<Vec<usize>> = Vec::new();
    let max_non_perm = non_permanent.len().min(k);
    for size in 1..=max_non_perm {
        for subset in super::combinatorics::subsets_of_size(&non_permanent, size) {
            for perm in permutations_of(&subset) {
                combined.push(perm.clone());
                for prefix in &permanent_subsets {
                    if prefix.len() + perm.len() <= k {
                        let mut with_prefix = prefix.clone();
                        with_prefix.extend(perm.iter().copied());
                        combined.push(with_prefix);
                    }
                }
            }
        }
    }
    if max_non_perm == 0 {
        combined.extend(permanent_subsets.iter().cloned());
    }

    combined.sort();
    combined.dedup();
    combined.sort_by_key(|p| (p.len(), p.clone()));
    combined
}

fn is_permanent(model: &FaultModel) -> bool {
    match model {
        FaultModel::Instruction(m) => matches!(m.lifetime, crate::fault::InstructionFaultLifetime::Permanent),
        FaultModel::Register(m) => matches!(m.lifetime, crate::fault::RegisterFaultLifetime::Permanent),
    }
}

/// spec.md §4.4 "Prepare the known-exploitable-fault index": gather every
/// non-empty subset's hash from combinations recorded under `S(P)` (`P`
/// minus its last element) or `T(P)` (just the last element).
fn collect_known_redundant_hashes(permutation: &[usize], memo: &FxHashMap<Vec<usize>, Vec<FaultCombination>>) -> Vec<(u64, FaultCombination)> {
    let mut known = Vec::new();
    let mut keys: Vec<Vec<usize>> = Vec::new();
    if let Some((_, prefix)) = permutation.split_last() {
        keys.push(prefix.to_vec());
    }
    if let Some(last) = permutation.last() {
        keys.push(vec![*last]);
    }
    for key in keys {
        if let Some(combos) = memo.get(&key) {
            for combo in combos {
                known.push((hash_of(combo), combo.clone()));
            }
        }
    }
    known
}

fn hash_of(combo: &FaultCombination) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    combo.hash(&mut hasher);
    hasher.finish()
}

/// spec.md §4.7 `is_fault_redundant`: `C` is redundant against the known
/// set if some previously recorded combination is a subset (per
/// [`FaultCombination::includes`]) of `C`.
fn is_fault_redundant(candidate: &FaultCombination, known: &Mutex<Vec<(u64, FaultCombination)>>) -> bool {
    let known = known.lock().unwrap();
    known.iter().any(|(_, recorded)| recorded.len() <= candidate.len() && candidate.includes(recorded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{skip_instruction_model, InstructionFaultLifetime};

    #[test]
    fn compute_model_combinations_respects_k() {
        let models = vec![FaultModel::Instruction(skip_instruction_model())];
        let permutations = compute_model_combinations(&models, &[1], 1);
        assert!(permutations.iter().all(|p| p.len() <= 1));
        assert!(permutations.contains(&vec![0]));
    }

    #[test]
    fn is_permanent_reflects_model_lifetime() {
        let mut model = skip_instruction_model();
        assert!(!is_permanent(&FaultModel::Instruction(model)));
        model = crate::fault::skip_instruction_model();
        model.lifetime = InstructionFaultLifetime::Permanent;
        assert!(is_permanent(&FaultModel::Instruction(model)));
    }
}
