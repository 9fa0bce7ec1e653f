//! Counter-based noise keys for reproducible, per-draw independent noise.
//!
//! A [`NoiseKey`] is a Threefry-2x32 key. Keys are never mutated: new keys are
//! derived with [`NoiseKey::fold_in`] (one per forward step) and
//! [`NoiseKey::split`] (one per noise draw), and each derived key yields its
//! own [`NoiseRng`] stream.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rand::{CryptoRng, RngCore};

/// Rotation constants of Threefry-2x32, applied in two alternating groups.
const ROTATIONS: [[u32; 4]; 2] = [[13, 15, 26, 6], [17, 29, 16, 24]];

/// Key-schedule parity constant.
const PARITY: u32 = 0x1BD1_1BDA;

/// A Threefry key (two u32 words).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NoiseKey {
    /// High key word.
    pub hi: u32,
    /// Low key word.
    pub lo: u32,
}

impl NoiseKey {
    /// Create a key from a 64-bit seed.
    pub fn new(seed: u64) -> Self {
        let (hi, lo) = split_u64(seed);
        Self { hi, lo }
    }

    /// Create a key from raw words.
    pub fn from_words(hi: u32, lo: u32) -> Self {
        Self { hi, lo }
    }

    /// Derive `n` keys, one per index in `0..n`.
    pub fn split(self, n: usize) -> Vec<Self> {
        (0..n as u64)
            .map(|i| {
                let (c0, c1) = split_u64(i);
                let (hi, lo) = threefry2x32(self, c0, c1);
                Self { hi, lo }
            })
            .collect()
    }

    /// Derive a key bound to `data` (for example a step counter).
    pub fn fold_in(self, data: u64) -> Self {
        let (d0, d1) = split_u64(data);
        // Keep the fold-in domain disjoint from `split` counters.
        let (hi, lo) = threefry2x32(self, d0 ^ PARITY, d1);
        Self { hi, lo }
    }

    /// Keys for each of `n_draws` noise draws at a given step.
    pub fn draw_keys(self, step: u64, n_draws: usize) -> Vec<Self> {
        self.fold_in(step).split(n_draws)
    }

    /// Turn the key into a random stream.
    pub fn to_rng(self) -> NoiseRng {
        NoiseRng::new(self)
    }
}

/// Random stream over a key and a running block counter.
#[derive(Clone, Debug)]
pub struct NoiseRng {
    key: NoiseKey,
    block: u64,
    buffered: Option<u32>,
}

impl NoiseRng {
    /// Create a stream at block zero.
    pub fn new(key: NoiseKey) -> Self {
        Self {
            key,
            block: 0,
            buffered: None,
        }
    }

    fn next_block(&mut self) -> (u32, u32) {
        let (c0, c1) = split_u64(self.block);
        self.block = self.block.wrapping_add(1);
        threefry2x32(self.key, c1, c0)
    }
}

impl RngCore for NoiseRng {
    fn next_u32(&mut self) -> u32 {
        if let Some(word) = self.buffered.take() {
            return word;
        }
        let (a, b) = self.next_block();
        self.buffered = Some(b);
        a
    }

    fn next_u64(&mut self) -> u64 {
        let lo = self.next_u32() as u64;
        let hi = self.next_u32() as u64;
        (hi << 32) | lo
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for NoiseRng {}

fn split_u64(x: u64) -> (u32, u32) {
    ((x >> 32) as u32, x as u32)
}

/// Threefry-2x32 with 20 rounds, injecting the key schedule every 4 rounds.
fn threefry2x32(key: NoiseKey, x0: u32, x1: u32) -> (u32, u32) {
    let ks = [key.hi, key.lo, key.hi ^ key.lo ^ PARITY];
    let mut x = [x0.wrapping_add(ks[0]), x1.wrapping_add(ks[1])];

    for injection in 1..=5u32 {
        let rotations = ROTATIONS[((injection - 1) % 2) as usize];
        for rot in rotations {
            x[0] = x[0].wrapping_add(x[1]);
            x[1] = x[1].rotate_left(rot) ^ x[0];
        }
        let i = injection as usize;
        x[0] = x[0].wrapping_add(ks[i % 3]);
        x[1] = x[1].wrapping_add(ks[(i + 1) % 3]).wrapping_add(injection);
    }

    (x[0], x[1])
}

/// Common imports for noise keys.
pub mod prelude {
    pub use crate::{NoiseKey, NoiseRng};
}
