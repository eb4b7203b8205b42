//! Process-wide (per-thread) settings and randomness provider.
//!
//! The engine is single-threaded by design, so the provider lives in a
//! thread local. Every sampling decision asks for a fresh randomness
//! source through [`Config::fresh_rng`]; with a seed installed the
//! sources form a deterministic stream, which is how the tests pin
//! measurement outcomes.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;

/// Global feature toggles and the randomness seed.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Attempt `contract` after state-changing operations.
    pub auto_contract: bool,
    /// Let operations resize truncatable subsystems to the dimensions
    /// their descriptors request.
    pub dynamic_dimensions: bool,
    /// Deterministic seed for measurement sampling; `None` draws from
    /// entropy.
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_contract: false,
            dynamic_dimensions: false,
            seed: None,
        }
    }
}

thread_local! {
    static CONFIG: RefCell<(Config, u64)> = RefCell::new((Config::default(), 0));
}

fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

impl Config {
    /// Snapshot of the currently installed configuration.
    pub fn current() -> Config {
        CONFIG.with(|c| c.borrow().0)
    }

    /// Install a configuration, resetting the randomness stream.
    pub fn install(config: Config) {
        CONFIG.with(|c| *c.borrow_mut() = (config, 0));
    }

    /// Toggle automatic contraction attempts.
    pub fn set_auto_contract(enabled: bool) {
        CONFIG.with(|c| c.borrow_mut().0.auto_contract = enabled);
    }

    /// Toggle dynamic dimension sizing.
    pub fn set_dynamic_dimensions(enabled: bool) {
        CONFIG.with(|c| c.borrow_mut().0.dynamic_dimensions = enabled);
    }

    /// Install a deterministic seed and reset the randomness stream.
    pub fn set_seed(seed: Option<u64>) {
        CONFIG.with(|c| {
            let mut state = c.borrow_mut();
            state.0.seed = seed;
            state.1 = 0;
        });
    }

    /// A fresh randomness source, used once per sampling decision.
    ///
    /// Seeded configurations derive source `n` from the seed and the
    /// number of sources handed out so far, so a run replays exactly.
    pub fn fresh_rng() -> StdRng {
        CONFIG.with(|c| {
            let mut state = c.borrow_mut();
            let draw = state.1;
            state.1 += 1;
            match state.0.seed {
                Some(seed) => StdRng::seed_from_u64(splitmix(seed ^ splitmix(draw))),
                None => StdRng::from_entropy(),
            }
        })
    }
}
