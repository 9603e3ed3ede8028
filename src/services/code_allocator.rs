//! Join code allocation: two uppercase letters followed by four digits.

use std::collections::HashSet;

use rand::{Rng, SeedableRng, rngs::StdRng};
use thiserror::Error;

const LETTERS: u32 = 26;
const DIGITS_SPACE: u32 = 10_000;
/// Number of distinct join codes.
pub const CODE_SPACE: usize = (LETTERS * LETTERS * DIGITS_SPACE) as usize;
/// Random draws attempted before falling back to a linear scan.
const RANDOM_ATTEMPTS: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("every join code is in use ({in_use} live codes)")]
    ExhaustedSpace { in_use: usize },
}

/// Whether `code` has the `[A-Z]{2}[0-9]{4}` shape.
pub fn is_valid_code(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 6
        && bytes[..2].iter().all(u8::is_ascii_uppercase)
        && bytes[2..].iter().all(u8::is_ascii_digit)
}

fn code_at(index: u32) -> String {
    let digits = index % DIGITS_SPACE;
    let letters = index / DIGITS_SPACE;
    let first = char::from(b'A' + (letters / LETTERS) as u8);
    let second = char::from(b'A' + (letters % LETTERS) as u8);
    format!("{first}{second}{digits:04}")
}

/// Seeded generator of join codes.
pub struct CodeAllocator {
    rng: StdRng,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeAllocator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic allocator, for tests.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Pick a code absent from `existing`.
    ///
    /// Random draws are tried first; a dense code space falls back to probing
    /// forward from a random index, which bounds the work to one pass.
    pub fn allocate(&mut self, existing: &HashSet<String>) -> Result<String, AllocationError> {
        if existing.len() >= CODE_SPACE {
            return Err(AllocationError::ExhaustedSpace {
                in_use: existing.len(),
            });
        }

        for _ in 0..RANDOM_ATTEMPTS {
            let candidate = code_at(self.rng.random_range(0..CODE_SPACE as u32));
            if !existing.contains(&candidate) {
                return Ok(candidate);
            }
        }

        let start = self.rng.random_range(0..CODE_SPACE as u32);
        (0..CODE_SPACE as u32)
            .map(|offset| code_at((start + offset) % CODE_SPACE as u32))
            .find(|candidate| !existing.contains(candidate))
            .ok_or(AllocationError::ExhaustedSpace {
                in_use: existing.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_have_the_join_format() {
        let mut allocator = CodeAllocator::with_seed(7);
        let existing = HashSet::new();
        for _ in 0..100 {
            let code = allocator.allocate(&existing).unwrap();
            assert!(is_valid_code(&code), "{code}");
        }
    }

    #[test]
    fn index_mapping_covers_the_edges() {
        assert_eq!(code_at(0), "AA0000");
        assert_eq!(code_at(CODE_SPACE as u32 - 1), "ZZ9999");
    }

    #[test]
    fn allocation_avoids_live_codes() {
        let mut allocator = CodeAllocator::with_seed(42);
        let mut existing = HashSet::new();
        for _ in 0..500 {
            let code = allocator.allocate(&existing).unwrap();
            assert!(existing.insert(code));
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let existing = HashSet::new();
        let mut a = CodeAllocator::with_seed(3);
        let mut b = CodeAllocator::with_seed(3);
        assert_eq!(a.allocate(&existing), b.allocate(&existing));
    }

    #[test]
    fn validation_rejects_malformed_codes() {
        assert!(is_valid_code("QZ0420"));
        for bad in ["qz0420", "Q10420", "QZ042", "QZ04200", "QZ04A0", ""] {
            assert!(!is_valid_code(bad), "{bad}");
        }
    }
}
