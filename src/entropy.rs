//! Per-worker secrets and session salt material.
//!
//! The supervisor owns a single entropy sequence. It is seeded lazily, at
//! the first draw after external events have been observed, folding the
//! wall-clock jitter between boot and that first event into the seed so the
//! sequence position depends on outside timing. Every draw advances the
//! sequence; the draw for a spawn therefore happens in the supervisor
//! before the worker exists, and each worker derives its own independent
//! generator so siblings never share state.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

pub struct EntropySource {
    booted: Instant,
    jitter: Option<u64>,
    rng: Option<StdRng>,
}

impl EntropySource {
    pub fn new() -> Self {
        Self {
            booted: Instant::now(),
            jitter: None,
            rng: None,
        }
    }

    /// Record that an external event has been observed.
    ///
    /// The first observation captures the jitter word used for lazy
    /// seeding; later calls are no-ops.
    pub fn observe_event(&mut self) {
        if self.jitter.is_some() {
            return;
        }
        let mut micros = self.booted.elapsed().as_micros() as u64;
        // Swap halves so the fast-moving low bits land in both words.
        micros = (micros << 32) | (micros >> 32);
        let mut jitter = micros ^ self.booted.elapsed().as_micros() as u64;
        while jitter == 0 {
            jitter = self.booted.elapsed().as_micros() as u64;
        }
        self.jitter = Some(jitter);
    }

    fn rng(&mut self) -> &mut StdRng {
        if self.rng.is_none() {
            self.observe_event();
            // The jitter word positions the sequence; OS entropy keeps the
            // secrets unguessable.
            let seed = self.jitter.unwrap_or(1) ^ rand::random::<u64>();
            self.rng = Some(StdRng::seed_from_u64(seed));
        }
        match self.rng.as_mut() {
            Some(rng) => rng,
            None => unreachable!("generator seeded above"),
        }
    }

    /// Draw a fresh cancel secret, advancing the sequence.
    pub fn next_secret(&mut self) -> u32 {
        self.rng().next_u32()
    }

    /// Draw the 4-byte per-session salt material.
    ///
    /// Each byte avoids zero so the salt survives NUL-terminated handling.
    pub fn session_salt(&mut self) -> [u8; 4] {
        let rng = self.rng();
        let mut salt = [0u8; 4];
        for b in &mut salt {
            *b = rng.gen_range(1..=255u16) as u8;
        }
        salt
    }

    /// Derive the seed for a worker's own generator.
    ///
    /// Drawing it here advances the supervisor sequence, so the worker and
    /// any later sibling start from unrelated positions.
    pub fn worker_seed(&mut self) -> u64 {
        self.rng().next_u64()
    }
}

impl Default for EntropySource {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a worker-local generator from a seed drawn by the supervisor.
pub fn worker_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
