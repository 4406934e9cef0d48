//! Utility functions for the library.
use ahash::AHashMap;
use fixedbitset_stack::on_stack::{get_nblock, FixedBitSet};

pub(crate) type ByteSet = FixedBitSet<{ get_nblock(u8::MAX as usize) }>;

pub(crate) fn get_display_form_from_bitset(bitset: &fixedbitset_stack::FixedBitSet) -> Vec<usize> {
    bitset.ones().collect()
}

pub(crate) fn get_deterministic_display_form_from_hash_map<K, V, U: Ord + Clone, Y>(
    map: &AHashMap<K, V>,
    process: impl FnMut((&K, &V)) -> (U, Y),
) -> Vec<(U, Y)> {
    let mut a: Vec<_> = map.iter().map(process).collect();
    a.sort_by_cached_key(|(k, _)| k.clone());
    a
}

/// Returns the byte index right after the first occurrence of `needle` that ends after `from`.
///
/// Occurrences that end at or before `from` were already visible in an earlier state.
pub(crate) fn find_occurrence_ending_after(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack
        .match_indices(needle)
        .map(|(i, _)| i + needle.len())
        .find(|end| *end > from)
}

/// The last `n` bytes of `s`, widened to the previous char boundary.
pub(crate) fn char_suffix(s: &str, n: usize) -> &str {
    let mut start = s.len().saturating_sub(n);
    while !s.is_char_boundary(start) {
        start -= 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_suffix_snaps_to_char_boundaries() {
        assert_eq!(char_suffix("hello", 2), "lo");
        assert_eq!(char_suffix("hé", 1), "é");
        assert_eq!(char_suffix("ab", 5), "ab");
        assert_eq!(char_suffix("ab", 0), "");
    }
}
