//! Sliding window averaging filter.

/// Average of the last `N` samples.
///
/// The first sample after creation or reset fills the whole window.
#[derive(Clone, Debug)]
pub struct Average<const N: usize> {
    window: [u16; N],
    pos: usize,
    sum: u32,
    seeded: bool,
}

impl<const N: usize> Default for Average<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Average<N> {
    /// Creates an empty filter.
    pub const fn new() -> Self {
        assert!(N > 0);
        Self { window: [0; N], pos: 0, sum: 0, seeded: false }
    }

    /// Forgets all samples.
    pub fn reset(&mut self) {
        self.seeded = false;
    }

    /// Adds a sample and returns the new average.
    pub fn add(&mut self, value: u16) -> u16 {
        if !self.seeded {
            self.window = [value; N];
            self.sum = value as u32 * N as u32;
            self.pos = 0;
            self.seeded = true;
        } else {
            self.sum = self.sum - self.window[self.pos] as u32 + value as u32;
            self.window[self.pos] = value;
        }
        self.pos = (self.pos + 1) % N;
        self.value().unwrap_or(value)
    }

    /// Current average, if a sample was added since the last reset.
    pub fn value(&self) -> Option<u16> {
        self.seeded.then(|| (self.sum / N as u32) as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_window() {
        let mut avg = Average::<6>::new();
        assert_eq!(avg.value(), None);
        assert_eq!(avg.add(12000), 12000);
        assert_eq!(avg.add(6000), 11000);
    }

    #[test]
    fn reset_reseeds() {
        let mut avg = Average::<6>::new();
        avg.add(100);
        avg.add(200);
        avg.reset();
        assert_eq!(avg.value(), None);
        assert_eq!(avg.add(5000), 5000);
    }

    #[test]
    fn window_slides() {
        let mut avg = Average::<3>::new();
        avg.add(0);
        avg.add(30);
        avg.add(60);
        assert_eq!(avg.value(), Some(30));
        assert_eq!(avg.add(90), 60);
    }

    #[test]
    fn output_stays_within_input_range() {
        let mut seed = 0xace1u32;
        for _ in 0..50 {
            let mut avg = Average::<6>::new();
            let (mut lo, mut hi) = (u16::MAX, u16::MIN);
            for _ in 0..100 {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                let v = (seed >> 16) as u16;
                lo = lo.min(v);
                hi = hi.max(v);
                let out = avg.add(v);
                assert!(lo <= out && out <= hi, "{out} outside [{lo}, {hi}]");
            }
        }
    }
}
