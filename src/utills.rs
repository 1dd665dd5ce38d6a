use crate::error::Result;
use crate::ml::{Shape, Tensor};

pub mod rand {
    /// Used when a zero seed is given or the OS has no entropy to offer.
    const FALLBACK_SEED: u64 = 0x2545_F491_4F6C_DD1D;

    /// Marsaglia xorshift generator; deterministic for a given seed.
    #[derive(Clone, Debug)]
    pub struct XorShift64 {
        state: u64,
    }

    impl XorShift64 {
        pub fn new(seed: u64) -> Self {
            // an all-zero state never leaves zero
            let state = if seed == 0 { FALLBACK_SEED } else { seed };
            XorShift64 { state }
        }

        pub fn from_entropy() -> Self {
            let mut bytes = [0u8; 8];
            if let Err(error) = getrandom::getrandom(&mut bytes) {
                tracing::warn!(%error, "no entropy source, using fixed seed");
                return Self::new(FALLBACK_SEED);
            }
            Self::new(u64::from_le_bytes(bytes))
        }

        pub fn next_u64(&mut self) -> u64 {
            self.state ^= self.state << 13;
            self.state ^= self.state >> 7;
            self.state ^= self.state << 17;
            self.state
        }

        /// Uniform in `[min, max)`, from 24 bits of the low word of the next draw.
        pub fn gen_range_f32(&mut self, min: f32, max: f32) -> f32 {
            // the high word of early draws from small seeds is still near zero
            let unit = ((self.next_u64() as u32) >> 8) as f32 / (1u32 << 24) as f32;
            min + (max - min) * unit
        }

        /// Fisher-Yates, walking from the back.
        pub fn shuffle<T>(&mut self, items: &mut [T]) {
            for last in (1..items.len()).rev() {
                let pick = (self.next_u64() % (last as u64 + 1)) as usize;
                items.swap(last, pick);
            }
        }
    }
}

/// Materialized 32-bit tensor of values drawn uniformly from `[min, max)`.
pub fn random_tensor(shape: Shape, min: f32, max: f32, seed: u64) -> Result<Tensor> {
    let mut rng = rand::XorShift64::new(seed);
    let values = (0..shape.size())
        .map(|_| rng.gen_range_f32(min, max))
        .collect();
    Tensor::new(values, shape)
}
