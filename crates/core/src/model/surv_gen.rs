//! Distinct-age counter used for the "surviving generations" statistic.

const INITIAL_CAPACITY: usize = 11;

/// Open-addressed set of object ages (in GC epochs).
///
/// Only cardinality matters: `total_no_of_ages` answers "how many different
/// generations do the live objects below this node belong to".
#[derive(Debug, Clone)]
pub struct SurvivingGenerationSet {
    ages: Vec<Option<u32>>,
    len: usize,
    threshold: usize,
}

impl SurvivingGenerationSet {
    pub fn new() -> Self {
        Self {
            ages: vec![None; INITIAL_CAPACITY],
            len: 0,
            threshold: load_threshold(INITIAL_CAPACITY),
        }
    }

    /// Record an age. Adding an age already present changes nothing.
    pub fn add_age(&mut self, age: u32) {
        if insert(&mut self.ages, age) {
            self.len += 1;
            if self.len >= self.threshold {
                self.rehash();
            }
        }
    }

    /// Fold every age of `other` into `self`.
    pub fn merge_with(&mut self, other: &SurvivingGenerationSet) {
        for &age in other.ages.iter().flatten() {
            self.add_age(age);
        }
    }

    pub fn total_no_of_ages(&self) -> usize {
        self.len
    }

    pub fn contains(&self, age: u32) -> bool {
        let cap = self.ages.len();
        let mut slot = age as usize % cap;
        loop {
            match self.ages[slot] {
                None => return false,
                Some(a) if a == age => return true,
                _ => slot = (slot + 1) % cap,
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.ages.len()
    }

    fn rehash(&mut self) {
        let capacity = self.ages.len() * 2 + 1;
        let old = std::mem::replace(&mut self.ages, vec![None; capacity]);
        for age in old.into_iter().flatten() {
            insert(&mut self.ages, age);
        }
        self.threshold = load_threshold(capacity);
    }
}

impl Default for SurvivingGenerationSet {
    fn default() -> Self {
        Self::new()
    }
}

fn load_threshold(capacity: usize) -> usize {
    capacity * 3 / 4
}

/// Linear probe from `age % capacity`. Returns false if `age` was present.
/// The table always keeps at least one empty slot, so the probe terminates.
fn insert(ages: &mut [Option<u32>], age: u32) -> bool {
    let cap = ages.len();
    let mut slot = age as usize % cap;
    loop {
        match ages[slot] {
            None => {
                ages[slot] = Some(age);
                return true;
            }
            Some(a) if a == age => return false,
            _ => slot = (slot + 1) % cap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn duplicate_age_counted_once() {
        let mut set = SurvivingGenerationSet::new();
        set.add_age(4);
        set.add_age(4);
        assert_eq!(set.total_no_of_ages(), 1);
        assert!(set.contains(4));
        assert!(!set.contains(5));
    }

    #[test]
    fn merge_overlapping_sets() {
        let mut a = SurvivingGenerationSet::new();
        let mut b = SurvivingGenerationSet::new();
        for age in [1, 2, 3] {
            a.add_age(age);
        }
        for age in [2, 3, 4] {
            b.add_age(age);
        }
        a.merge_with(&b);
        assert_eq!(a.total_no_of_ages(), 4);
        assert_eq!(b.total_no_of_ages(), 3);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut set = SurvivingGenerationSet::new();
        for age in 0..8 {
            set.add_age(age);
        }
        // 8 == 3/4 of 11: the table doubled to 23.
        assert_eq!(set.capacity(), 23);
        for age in 0..100 {
            set.add_age(age * 11);
        }
        assert_eq!(set.total_no_of_ages(), 8 + 99);
        assert!((0..100).all(|age| set.contains(age * 11)));
    }

    #[test]
    fn ages_near_u32_max_stay_distinct() {
        let mut set = SurvivingGenerationSet::new();
        set.add_age(u32::MAX);
        set.add_age(u32::MAX - 1);
        set.add_age(i32::MAX as u32 + 1);
        assert_eq!(set.total_no_of_ages(), 3);
        assert!(set.contains(u32::MAX));
        assert!(!set.contains(i32::MAX as u32));
    }

    #[test]
    fn colliding_ages_probe_linearly() {
        let mut set = SurvivingGenerationSet::new();
        set.add_age(0);
        set.add_age(11);
        set.add_age(22);
        assert_eq!(set.total_no_of_ages(), 3);
        assert!(set.contains(22));
    }

    proptest! {
        #[test]
        fn cardinality_matches_distinct_inputs(ages in proptest::collection::vec(0u32..500, 0..200)) {
            let mut set = SurvivingGenerationSet::new();
            for &age in &ages {
                set.add_age(age);
            }
            let distinct: std::collections::HashSet<_> = ages.iter().collect();
            prop_assert_eq!(set.total_no_of_ages(), distinct.len());
        }

        #[test]
        fn disjoint_merge_adds_sizes(m in 0u32..60, n in 0u32..60) {
            let mut a = SurvivingGenerationSet::new();
            let mut b = SurvivingGenerationSet::new();
            (0..m).for_each(|age| a.add_age(age));
            (1000..1000 + n).for_each(|age| b.add_age(age));
            a.merge_with(&b);
            prop_assert_eq!(a.total_no_of_ages(), (m + n) as usize);
        }
    }
}
