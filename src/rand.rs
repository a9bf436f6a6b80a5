use ring::rand::{SecureRandom as RingRandom, SystemRandom};

use crate::error::Error;

/// Source of cryptographic randomness, injectable for deterministic tests.
pub trait Rng: Send + Sync {
    fn fill(&self, buf: &mut [u8]) -> Result<(), Error>;
}

/// The process-wide CSPRNG.
pub struct SystemRng {
    inner: SystemRandom,
}

impl SystemRng {
    pub fn new() -> Self {
        SystemRng {
            inner: SystemRandom::new(),
        }
    }
}

impl Default for SystemRng {
    fn default() -> Self {
        Self::new()
    }
}

impl Rng for SystemRng {
    fn fill(&self, buf: &mut [u8]) -> Result<(), Error> {
        self.inner
            .fill(buf)
            .map_err(|_| Error::InternalError("rng failure"))
    }
}

/// Fixed-output randomness for tests: repeats the configured byte.
#[doc(hidden)]
pub struct FixedRng(pub u8);

impl Rng for FixedRng {
    fn fill(&self, buf: &mut [u8]) -> Result<(), Error> {
        for b in buf.iter_mut() {
            *b = self.0;
        }
        Ok(())
    }
}
