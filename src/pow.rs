//! Proof-of-work challenges used to rate-limit admission requests.
//!
//! The challenge is: find a `u64` counter such that
//! `SHA-256(nonce || counter)`, read as a 256-bit binary string, begins with
//! `difficulty` zero bits. `solve` performs the brute-force search; `validate`
//! re-checks a claimed solution in constant work.

use sha2::{Digest, Sha256};

/// `difficulty` must fall in `1..=256`; anything else can never be satisfied
/// (0 is trivially satisfied by any input, 257+ exceeds the hash width).
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PowError {
    #[error("difficulty must be between 1 and 256, got {0}")]
    InvalidDifficulty(u32),
    #[error("no solution found in the u64 counter space")]
    NoSolutionFound,
}

fn leading_zero_bits(digest: &[u8]) -> u32 {
    let mut zeros = 0u32;
    for byte in digest {
        if *byte == 0 {
            zeros += 8;
            continue;
        }
        zeros += byte.leading_zeros();
        break;
    }
    zeros
}

fn digest_for(nonce: &str, counter: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(counter.to_string().as_bytes());
    hasher.finalize().into()
}

/// Brute-force the smallest non-negative counter satisfying `difficulty`.
pub fn solve(nonce: &str, difficulty: u32) -> Result<u64, PowError> {
    if difficulty == 0 || difficulty > 256 {
        return Err(PowError::InvalidDifficulty(difficulty));
    }

    for counter in 0..=u64::MAX {
        let digest = digest_for(nonce, counter);
        if leading_zero_bits(&digest) >= difficulty {
            return Ok(counter);
        }
        if counter == u64::MAX {
            break;
        }
    }

    Err(PowError::NoSolutionFound)
}

/// Check whether `response` actually satisfies the challenge.
pub fn validate(nonce: &str, difficulty: u32, response: u64) -> bool {
    if difficulty == 0 || difficulty > 256 {
        return false;
    }
    leading_zero_bits(&digest_for(nonce, response)) >= difficulty
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_known_challenge() {
        let nonce = "dfe041b4f60cb54d082e542b109e392a";
        let difficulty = 22;

        let solution = solve(nonce, difficulty).unwrap();

        assert_eq!(solution, 9642966);
    }

    #[test]
    fn validates_known_solution() {
        let nonce = "dfe041b4f60cb54d082e542b109e392a";
        let difficulty = 22;

        assert!(validate(nonce, difficulty, 9642966));
    }

    #[test]
    fn rejects_wrong_solution() {
        assert!(!validate("dfe041b4f60cb54d082e542b109e392a", 22, 0));
    }

    #[test]
    fn rejects_out_of_range_difficulty() {
        assert_eq!(
            solve("n", 0).unwrap_err(),
            PowError::InvalidDifficulty(0)
        );
        assert_eq!(
            solve("n", 257).unwrap_err(),
            PowError::InvalidDifficulty(257)
        );
        assert!(!validate("n", 0, 1));
    }

    #[test]
    fn low_difficulty_is_trivially_solved() {
        let solution = solve("anything", 1).unwrap();
        assert!(validate("anything", 1, solution));
    }
}
