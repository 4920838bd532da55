//! Opaque voucher code generation.
//!
//! Codes are drawn from the OS CSPRNG and checked against every code ever
//! issued (the UNIQUE index on `vouchers.code` is the backstop). The number
//! of draws is bounded; when the configured length is crowded the generator
//! widens once by two characters before giving up with `CodeExhausted`.

use rand::rngs::OsRng;
use rand::Rng;
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::config::VoucherConfig;
use crate::error::{FisioError, Result};

/// Characters added to the code length when widening.
const WIDEN_BY: usize = 2;

/// Draw one code of `len` characters from `alphabet`.
#[must_use]
pub fn generate_code<R: Rng + ?Sized>(rng: &mut R, alphabet: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| char::from(alphabet[rng.gen_range(0..alphabet.len())]))
        .collect()
}

/// Draw codes until `is_taken` reports a free one.
///
/// # Errors
/// Returns [`FisioError::CodeExhausted`] when every attempt collided, or
/// whatever `is_taken` returns.
pub fn allocate_with<R, F>(config: &VoucherConfig, rng: &mut R, mut is_taken: F) -> Result<String>
where
    R: Rng + ?Sized,
    F: FnMut(&str) -> Result<bool>,
{
    let alphabet = config.code_alphabet.as_bytes();
    if alphabet.is_empty() || config.code_length == 0 {
        return Err(FisioError::Config("voucher code alphabet and length must be non-empty".into()));
    }

    let mut lengths = vec![config.code_length];
    if config.widen_on_exhaustion {
        lengths.push(config.code_length + WIDEN_BY);
    }

    let mut attempts = 0u32;
    for len in lengths {
        for _ in 0..config.max_code_attempts {
            attempts += 1;
            let code = generate_code(rng, alphabet, len);
            if !is_taken(&code)? {
                debug!(attempts, len, "Voucher code allocated");
                return Ok(code);
            }
        }
        warn!(len, attempts, "Voucher code space crowded at this length");
    }

    Err(FisioError::CodeExhausted { attempts })
}

/// Allocate a code not present in `vouchers`, using the OS CSPRNG.
///
/// # Errors
/// See [`allocate_with`].
pub fn allocate(conn: &Connection, config: &VoucherConfig) -> Result<String> {
    let mut stmt = conn.prepare_cached("SELECT EXISTS(SELECT 1 FROM vouchers WHERE code = ?1)")?;
    allocate_with(config, &mut OsRng, |code| {
        Ok(stmt.query_row(params![code], |row| row.get::<_, bool>(0))?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    #[test]
    fn default_codes_are_eight_alphanumerics() {
        let config = VoucherConfig::default();
        let code = allocate_with(&config, &mut OsRng, |_| Ok(false)).expect("code");
        assert_eq!(code.len(), 8);
        assert!(code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn collisions_are_retried() {
        let config = VoucherConfig::default();
        let mut calls = 0;
        let code = allocate_with(&config, &mut StdRng::seed_from_u64(7), |_| {
            calls += 1;
            Ok(calls < 4)
        })
        .expect("code");
        assert_eq!(calls, 4);
        assert_eq!(code.len(), 8);
    }

    #[test]
    fn crowded_space_widens_before_exhausting() {
        let config = VoucherConfig {
            code_length: 1,
            code_alphabet: "A".into(),
            max_code_attempts: 3,
            ..VoucherConfig::default()
        };
        let mut taken: HashSet<String> = HashSet::from(["A".to_string()]);
        let code = allocate_with(&config, &mut StdRng::seed_from_u64(1), |c| Ok(taken.contains(c)))
            .expect("widened");
        assert_eq!(code, "AAA");

        taken.insert(code);
        let err = allocate_with(&config, &mut StdRng::seed_from_u64(1), |c| Ok(taken.contains(c)))
            .expect_err("exhausted");
        assert!(matches!(err, FisioError::CodeExhausted { attempts: 6 }));
    }

    #[test]
    fn without_widening_exhausts_at_configured_attempts() {
        let config = VoucherConfig {
            max_code_attempts: 5,
            widen_on_exhaustion: false,
            ..VoucherConfig::default()
        };
        let err = allocate_with(&config, &mut OsRng, |_| Ok(true)).expect_err("exhausted");
        assert!(matches!(err, FisioError::CodeExhausted { attempts: 5 }));
        assert_eq!(err.kind().as_str(), "CODE_EXHAUSTED");
    }
}
