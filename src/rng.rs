/* ------------------------------------------------------------------ */
/* Minimal xorshift PRNG                                              */
/* ------------------------------------------------------------------ */
//
// All run-level randomness (row sampling, eval sampling) flows through one
// of these, seeded 1337 + seed_offset so two runs with the same RunConfig
// draw the same batches.

pub const BASE_SEED: u64 = 1337;

pub struct Rng {
    state: u64,
}

impl Rng {
    pub fn new(seed: u64) -> Self {
        // xorshift has a single all-zero fixed point
        Self { state: seed.max(1) }
    }

    /// Run RNG for a given reproducibility offset.
    pub fn for_run(seed_offset: u64) -> Self {
        Self::new(BASE_SEED + seed_offset)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    pub fn uniform(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / 9007199254740992.0)
    }

    /// Box-Muller Gaussian, for parameter init.
    pub fn gauss(&mut self, mean: f32, std: f32) -> f32 {
        let u1 = self.uniform().max(1e-30);
        let u2 = self.uniform();
        let mag = ((-2.0 * u1.ln()).sqrt()) as f32;
        mean + std * mag * ((2.0 * std::f64::consts::PI * u2).cos() as f32)
    }

    /// Uniform draw from 0..n.
    pub fn choice(&mut self, n: usize) -> usize {
        debug_assert!(n > 0);
        ((self.uniform() * n as f64) as usize).min(n - 1)
    }

    /// Derive an independent stream, e.g. one per split.
    pub fn split(&mut self) -> Rng {
        Rng::new(self.next_u64() ^ 0x9e37_79b9_7f4a_7c15)
    }
}
