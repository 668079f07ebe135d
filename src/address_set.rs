use std::ops::RangeInclusive;

const WORDS: usize = (u16::MAX as usize + 1) / u64::BITS as usize;

/// A set of 16-bit register addresses.
#[derive(Clone, PartialEq, Eq)]
pub struct AddressSet(Box<[u64; WORDS]>);

impl Default for AddressSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AddressSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl AddressSet {
    pub fn new() -> Self {
        Self(Box::new([0; WORDS]))
    }

    fn word_bit_mask(address: u16) -> (usize, u64) {
        let word = (u32::from(address) / u64::BITS) as usize;
        let bit_mask = 1 << (u32::from(address) % u64::BITS);
        (word, bit_mask)
    }

    pub fn contains(&self, address: u16) -> bool {
        let (word, bitmask) = Self::word_bit_mask(address);
        (self.0[word] & bitmask) != 0
    }

    pub fn insert(&mut self, address: u16) {
        let (word, bitmask) = Self::word_bit_mask(address);
        self.0[word] |= bitmask;
    }

    /// Insert `count` consecutive addresses starting at `start`, stopping at the end of the
    /// address space.
    pub fn insert_range(&mut self, start: u16, count: u16) {
        for offset in 0..count {
            let Some(address) = start.checked_add(offset) else { break };
            self.insert(address);
        }
    }

    /// Returns `true` only if `superset` has all addresses from `self`.
    pub fn is_subset_of(&self, superset: &AddressSet) -> bool {
        self.0.iter().zip(superset.0.iter()).all(|(&our, &their)| (their & our) == our)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    pub fn first(&self) -> Option<u16> {
        self.iter().next()
    }

    pub fn last(&self) -> Option<u16> {
        let (word, value) = self.0.iter().enumerate().rev().find(|(_, w)| **w != 0)?;
        let bit = u64::BITS - 1 - value.leading_zeros();
        u16::try_from(word as u32 * u64::BITS + bit).ok()
    }

    pub fn iter(&self) -> Addresses<'_> {
        Addresses { set: self, word_index: 0, current_word_val: self.0[0] }
    }

    /// Cover all addresses with the fewest ranges no longer than `max_range_len`, preferring the
    /// smallest total span among equally short covers.
    pub fn find_optimal_ranges(&self, max_range_len: u16) -> Vec<RangeInclusive<u16>> {
        let addresses: Vec<u16> = self.iter().collect();
        let n = addresses.len();
        if n == 0 || max_range_len == 0 {
            return Vec::new();
        }
        // dp[i] is the (reads, words) cost of covering addresses[i..].
        let mut dp: Vec<(u32, u64)> = vec![(0, 0); n + 1];
        let mut choices: Vec<usize> = vec![0; n];
        for i in (0..n).rev() {
            let mut best_cost = (u32::MAX, u64::MAX);
            let mut best_choice = i;
            for j in i..n {
                let range_len = u32::from(addresses[j]) - u32::from(addresses[i]) + 1;
                if range_len > u32::from(max_range_len) {
                    break;
                }
                let rest = dp[j + 1];
                let cost = (1 + rest.0, u64::from(range_len) + rest.1);
                // Ties go to the longest leading range.
                if cost <= best_cost {
                    best_cost = cost;
                    best_choice = j;
                }
            }
            dp[i] = best_cost;
            choices[i] = best_choice;
        }
        let mut ranges = Vec::new();
        let mut i = 0;
        while i < n {
            let end = choices[i];
            ranges.push(addresses[i]..=addresses[end]);
            i = end + 1;
        }
        ranges
    }
}

pub struct Addresses<'a> {
    set: &'a AddressSet,
    word_index: usize,
    current_word_val: u64,
}

impl Iterator for Addresses<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current_word_val == 0 {
                self.word_index += 1;
                self.current_word_val = self.set.0.get(self.word_index).copied()?;
                continue;
            }
            let bit = self.current_word_val.trailing_zeros();
            self.current_word_val &= self.current_word_val - 1;
            return u16::try_from(self.word_index as u32 * u64::BITS + bit).ok();
        }
    }
}

impl FromIterator<u16> for AddressSet {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        let mut set = AddressSet::new();
        for address in iter {
            set.insert(address);
        }
        set
    }
}
