//! Ambient randomness as an explicit input (design notes §9): the engine
//! never reaches for a thread-local RNG, so a caller can swap in a
//! deterministic source for tests or fuzzing.

use rand::RngCore;

use crate::error::RandomnessError;

/// Capability trait for the engine's random source. `rand::rngs::OsRng` and
/// any seeded `rand::rngs::StdRng` implement it already via the blanket
/// `RngCore` impl below.
pub trait RandomSource: Send {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), RandomnessError>;
}

impl<T: RngCore + Send> RandomSource for T {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), RandomnessError> {
        self.try_fill_bytes(buf).map_err(|_| RandomnessError)
    }
}

pub fn random_array<const N: usize>(
    rng: &mut dyn RandomSource,
) -> Result<[u8; N], RandomnessError> {
    let mut buf = [0u8; N];
    rng.fill(&mut buf)?;
    Ok(buf)
}
