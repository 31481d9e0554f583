use std::num::NonZero;

/// The problem sizes visited during a measurement session, in bytes.
///
/// Sizes are kept in their natural (ordered) sequence. If randomization is requested, a separate
/// visitation order is derived from a seeded linear-congruential generator, so that the same seed
/// always visits the sizes in the same order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProblemSchedule {
    sizes: Vec<u64>,

    // visit_order[i] is the index into `sizes` visited at schedule index `i`.
    visit_order: Vec<usize>,

    randomized: bool,
}

impl ProblemSchedule {
    /// Interpolates `steps` sizes geometrically between `min` and `max`.
    ///
    /// The first entry is exactly `min` and the last entry is exactly `max`. Intermediate entries
    /// are truncated to whole bytes, so neighbors may repeat for narrow ranges.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if `min` is zero, `min` exceeds `max` or fewer than
    /// two steps are requested for a non-degenerate range.
    pub fn geometric(min: u64, max: u64, steps: NonZero<usize>) -> Result<Self, String> {
        if min == 0 {
            return Err("MIN must be greater than zero".to_string());
        }

        if min > max {
            return Err(format!("MIN ({min}) must not be greater than MAX ({max})"));
        }

        let steps = steps.get();

        if steps == 1 {
            if min != max {
                return Err("STEPS must be at least 2 unless MIN equals MAX".to_string());
            }

            return Ok(Self::from_sizes(vec![min]));
        }

        #[expect(
            clippy::cast_precision_loss,
            reason = "sizes are far below 2^52 and whole-byte precision is not needed"
        )]
        let (min_f, max_f, intervals) = (min as f64, max as f64, (steps - 1) as f64);

        let factor = (max_f / min_f).powf(1.0 / intervals);

        let mut sizes = Vec::with_capacity(steps);
        let mut current = min_f;

        for _ in 0..steps - 1 {
            #[expect(
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss,
                reason = "value is positive and we intentionally truncate to whole bytes"
            )]
            let size = current as u64;

            sizes.push(size.clamp(min, max));
            current *= factor;
        }

        // The interpolation is approximate; the last entry is not.
        sizes.push(max);

        Ok(Self::from_sizes(sizes))
    }

    /// Uses an explicitly supplied list of sizes, visited in the order given.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the list is empty or contains a zero size.
    pub fn explicit(sizes: Vec<u64>) -> Result<Self, String> {
        if sizes.is_empty() {
            return Err("the problem list is empty".to_string());
        }

        if sizes.contains(&0) {
            return Err("the problem list contains a zero size".to_string());
        }

        Ok(Self::from_sizes(sizes))
    }

    fn from_sizes(sizes: Vec<u64>) -> Self {
        let visit_order = (0..sizes.len()).collect();

        Self {
            sizes,
            visit_order,
            randomized: false,
        }
    }

    /// Visits the sizes in a pseudo-random order derived from `seed`.
    #[must_use]
    pub fn randomized(mut self, seed: u64) -> Self {
        self.visit_order = lcg_permutation(self.sizes.len(), seed);
        self.randomized = true;
        self
    }

    /// Number of entries in the schedule.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    /// Whether the schedule is empty. Schedules built by the public constructors never are.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Whether the visitation order was randomized.
    #[must_use]
    pub fn is_randomized(&self) -> bool {
        self.randomized
    }

    /// The problem size visited at schedule index `index`, or `None` if out of range.
    #[must_use]
    pub fn size_at(&self, index: usize) -> Option<u64> {
        let ordered_index = *self.visit_order.get(index)?;
        self.sizes.get(ordered_index).copied()
    }

    /// The sizes in their natural order, ignoring randomization.
    #[must_use]
    pub fn ordered_sizes(&self) -> &[u64] {
        &self.sizes
    }

    /// The sizes in the order they are visited.
    pub fn visit_sizes(&self) -> impl Iterator<Item = u64> {
        self.visit_order.iter().filter_map(|&i| self.sizes.get(i).copied())
    }

    /// The largest size in the schedule, which dictates buffer sizes.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.sizes.iter().copied().max().unwrap_or_default()
    }
}

/// Returns a permutation of `0..len` generated by a full-period linear-congruential generator.
///
/// The generator works modulo a power of two `m >= len`, with a multiplier congruent to 1 mod 4
/// and an odd increment, which guarantees every residue appears exactly once per period
/// (Hull-Dobell). Residues `>= len` are skipped.
fn lcg_permutation(len: usize, seed: u64) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }

    let modulus = (len as u64).max(4).next_power_of_two();
    let mask = modulus - 1;

    let multiplier = 1_103_515_245_u64 & mask;
    let increment = (seed.wrapping_mul(2) | 1) & mask;

    let mut state = seed & mask;
    let mut order = Vec::with_capacity(len);

    for _ in 0..modulus {
        state = multiplier.wrapping_mul(state).wrapping_add(increment) & mask;

        if let Ok(index) = usize::try_from(state)
            && index < len
        {
            order.push(index);
        }
    }

    debug_assert_eq!(order.len(), len);
    order
}
