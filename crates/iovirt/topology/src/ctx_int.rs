//! SMMUv1/v2 context interrupt uniqueness.

/// Returns `true` if the interrupt IDs in `entries` are pairwise distinct.
///
/// Entries are the raw 64-bit context interrupt records; only the low 32 bits
/// (the GSIV) take part in the comparison.
pub fn gsivs_unique<I>(entries: I) -> bool
where
    I: Iterator<Item = u64> + Clone,
{
    let mut outer = entries;
    while let Some(entry) = outer.next() {
        let gsiv = low32(entry);
        if outer.clone().any(|other| low32(other) == gsiv) {
            return false;
        }
    }
    true
}

#[allow(clippy::cast_possible_truncation)]
const fn low32(entry: u64) -> u32 {
    entry as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(&[5, 6, 7], true; "distinct")]
    #[test_case(&[5, 6, 5], false; "repeated")]
    #[test_case(&[], true; "empty")]
    #[test_case(&[9], true; "single")]
    #[test_case(&[0x1_0000_0005, 0x2_0000_0005], false; "flags differ only")]
    fn uniqueness(entries: &[u64], unique: bool) {
        assert_eq!(gsivs_unique(entries.iter().copied()), unique);
    }
}
