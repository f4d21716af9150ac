// Seedable xorshift64* generator for particle initialization

use glam::{Vec3, Vec4};
use std::time::{SystemTime, UNIX_EPOCH};

const FALLBACK_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

#[derive(Debug, Clone)]
pub struct Random {
    state: u64,
}

impl Random {
    pub fn new(seed: u64) -> Self {
        let mut random = Self { state: 0 };
        random.reseed(seed);
        random
    }

    /// Seed from the wall clock.
    pub fn from_time() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(FALLBACK_SEED);
        Self::new(nanos)
    }

    pub fn reseed(&mut self, seed: u64) {
        // xorshift never leaves zero
        self.state = if seed == 0 { FALLBACK_SEED } else { seed };
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut s = self.state;
        s ^= s >> 12;
        s ^= s << 25;
        s ^= s >> 27;
        self.state = s;
        s.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Uniform in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }

    /// Uniform in [lo, hi).
    pub fn range(&mut self, lo: f32, hi: f32) -> f32 {
        lo + (hi - lo) * self.next_f32()
    }

    pub fn vec3_between(&mut self, min: Vec3, max: Vec3) -> Vec3 {
        Vec3::new(
            self.range(min.x, max.x),
            self.range(min.y, max.y),
            self.range(min.z, max.z),
        )
    }

    /// Uniform inside the unit ball, by rejection.
    pub fn in_unit_sphere(&mut self) -> Vec3 {
        loop {
            let p = self.vec3_between(Vec3::splat(-1.0), Vec3::ONE);
            if p.length_squared() <= 1.0 {
                return p;
            }
        }
    }

    /// Opaque color with random RGB.
    pub fn color(&mut self) -> Vec4 {
        Vec4::new(self.next_f32(), self.next_f32(), self.next_f32(), 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Random::new(42);
        let mut b = Random::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn zero_seed_still_advances() {
        let mut r = Random::new(0);
        assert_ne!(r.next_u64(), r.next_u64());
    }

    #[test]
    fn floats_stay_in_range() {
        let mut r = Random::new(7);
        for _ in 0..10_000 {
            let x = r.range(-0.5, 2.0);
            assert!((-0.5..2.0).contains(&x));
            assert!(r.in_unit_sphere().length() <= 1.0);
        }
    }
}
