//! Subset and permutation enumeration over model indices (spec.md §4.4
//! `compute_model_combinations`), reimplemented as plain functions rather
//! than the original's stateful `SubsetChooser` object
//! (`examples/original_source/subprojects/armory/include/armory/subset_chooser.h`):
//! idiomatic Rust expresses "the next combination" as an iterator/Vec
//! rather than a mutable cursor object.

/// Every `k`-element subset of `items`, as index-preserving sublists, in
/// lexicographic order of index.
pub fn subsets_of_size(items: &[usize], k: usize) -> Vec<Vec<usize>> {
    if k > items.len() {
        return Vec::new();
    }
    if k == 0 {
        return vec![Vec::new()];
    }
    let mut result = Vec::new();
    let mut current = Vec::with_capacity(k);
    subsets_helper(items, k, 0, &mut current, &mut result);
    result
}

fn subsets_helper(items: &[usize], k: usize, start: usize, current: &mut Vec<usize>, result: &mut Vec<Vec<usize>>) {
    if current.len() == k {
        result.push(current.clone());
        return;
    }
    for i in start..items.len() {
        current.push(items[i]);
        subsets_helper(items, k, i + 1, current, result);
        current.pop();
    }
}

/// Every ordering of `items` (small inputs only: this is the textbook
/// `O(n!)` recursive generator, adequate for the handful of non-permanent
/// models a realistic fault campaign enables at once).
pub fn permutations_of(items: &[usize]) -> Vec<Vec<usize>> {
    if items.is_empty() {
        return vec![Vec::new()];
    }
    let mut result = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let chosen = rest.remove(i);
        for mut perm in permutations_of(&rest) {
            perm.insert(0, chosen);
            result.push(perm);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsets_of_size_two_from_three_items() {
        let subsets = subsets_of_size(&[0, 1, 2], 2);
        assert_eq!(subsets, vec![vec![0, 1], vec![0, 2], vec![1, 2]]);
    }

    #[test]
    fn permutations_of_three_items_has_six_orderings() {
        let perms = permutations_of(&[0, 1, 2]);
        assert_eq!(perms.len(), 6);
    }
}
