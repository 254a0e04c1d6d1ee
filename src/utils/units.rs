// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: MIT

use fvm_shared::bigint::BigInt;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::{PaddedPieceSize, UnpaddedPieceSize};

use crate::config::EPOCHS_PER_DAY;
use crate::error::{VaultError, VaultResult};

pub const GIB: u64 = 1 << 30;
pub const TIB: u64 = 1 << 40;

/// Decimal places between FIL and attoFIL
const FIL_DECIMALS: usize = 18;

/// Smallest power of two >= `size`. Idempotent.
///
/// Sizes above 2^63 have no u64 power of two and saturate at 2^63.
pub fn padded_piece_size(size: u64) -> u64 {
    size.max(1).checked_next_power_of_two().unwrap_or(1 << 63)
}

/// Usable payload bytes of a padded piece after Fr32 expansion (127/128)
pub fn unpadded_piece_size(padded: u64) -> VaultResult<u64> {
    let padded = PaddedPieceSize(padded);
    padded
        .validate()
        .map_err(|e| VaultError::validation(format!("padded piece size {}: {e}", padded.0)))?;
    let UnpaddedPieceSize(unpadded) = padded.unpadded();
    Ok(unpadded)
}

/// Whole GiB needed to hold `size` bytes, rounded up
pub fn bytes_to_gib_ceil(size: u64) -> u64 {
    size.div_ceil(GIB)
}

pub fn epochs_from_days(days: i64) -> i64 {
    days * EPOCHS_PER_DAY
}

/// Exact decimal conversion of a FIL amount string (e.g. "1.5") to attoFIL
pub fn fil_to_atto(fil: &str) -> VaultResult<TokenAmount> {
    let fil = fil.trim();
    let (negative, digits) = match fil.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, fil),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(VaultError::validation(format!("invalid FIL amount '{fil}'")));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(VaultError::validation(format!("invalid FIL amount '{fil}'")));
    }
    if frac.len() > FIL_DECIMALS {
        return Err(VaultError::validation(format!(
            "FIL amount '{fil}' has more than {FIL_DECIMALS} decimal places"
        )));
    }
    let scaled = format!(
        "{}{}{}",
        if whole.is_empty() { "0" } else { whole },
        frac,
        "0".repeat(FIL_DECIMALS - frac.len())
    );
    let mut atto: BigInt = scaled
        .parse()
        .map_err(|e| VaultError::validation(format!("invalid FIL amount '{fil}': {e}")))?;
    if negative {
        atto = -atto;
    }
    Ok(TokenAmount::from_atto(atto))
}

/// Exact decimal rendering of attoFIL as FIL, trailing zeros trimmed
pub fn atto_to_fil(amount: &TokenAmount) -> String {
    let atto = amount.atto();
    let negative = atto.sign() == fvm_shared::bigint::Sign::Minus;
    let digits = if negative { (-atto).to_string() } else { atto.to_string() };
    let padded = format!("{digits:0>width$}", width = FIL_DECIMALS + 1);
    let (whole, frac) = padded.split_at(padded.len() - FIL_DECIMALS);
    let frac = frac.trim_end_matches('0');
    let sign = if negative { "-" } else { "" };
    if frac.is_empty() {
        format!("{sign}{whole}")
    } else {
        format!("{sign}{whole}.{frac}")
    }
}

/// Parse an attoFIL decimal string as returned by the node (e.g. ask prices)
pub fn parse_atto(value: &str) -> VaultResult<TokenAmount> {
    let atto: BigInt = value
        .trim()
        .parse()
        .map_err(|e| VaultError::validation(format!("invalid attoFIL value '{value}': {e}")))?;
    Ok(TokenAmount::from_atto(atto))
}

/// Serde helpers rendering a TokenAmount as an attoFIL decimal string
pub mod atto_string {
    use fvm_shared::econ::TokenAmount;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &TokenAmount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.atto().to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TokenAmount, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_atto(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use fvm_shared::econ::TokenAmount;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            amount: &Option<TokenAmount>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match amount {
                Some(a) => serializer.serialize_some(&a.atto().to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<TokenAmount>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::super::parse_atto(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_size_is_least_power_of_two() {
        assert_eq!(padded_piece_size(1), 1);
        assert_eq!(padded_piece_size(127), 128);
        assert_eq!(padded_piece_size(128), 128);
        assert_eq!(padded_piece_size(129), 256);
        assert_eq!(padded_piece_size(10 * 1024 * 1024), 16 * 1024 * 1024);
    }

    #[test]
    fn padded_size_is_idempotent() {
        for x in [0u64, 1, 3, 1000, 4095, 4096, 1 << 35, (1 << 40) + 7] {
            let once = padded_piece_size(x);
            assert!(once >= x);
            assert!(once.is_power_of_two());
            assert_eq!(padded_piece_size(once), once);
        }
    }

    #[test]
    fn unpadded_uses_fr32_ratio() {
        assert_eq!(unpadded_piece_size(2048).unwrap(), 2032);
        assert!(unpadded_piece_size(1000).is_err());
    }

    #[test]
    fn fil_conversion_is_exact() {
        let atto = fil_to_atto("1.5").unwrap();
        assert_eq!(atto.atto().to_string(), "1500000000000000000");
        assert_eq!(atto_to_fil(&atto), "1.5");

        let tiny = fil_to_atto("0.000000000000000001").unwrap();
        assert_eq!(tiny.atto().to_string(), "1");
        assert_eq!(atto_to_fil(&tiny), "0.000000000000000001");

        assert_eq!(atto_to_fil(&fil_to_atto("42").unwrap()), "42");
        assert_eq!(atto_to_fil(&fil_to_atto("-0.25").unwrap()), "-0.25");
    }

    #[test]
    fn fil_conversion_rejects_bad_input() {
        assert!(fil_to_atto("1.2.3").is_err());
        assert!(fil_to_atto("abc").is_err());
        assert!(fil_to_atto(".").is_err());
        assert!(fil_to_atto("0.0000000000000000001").is_err());
    }

    #[test]
    fn gib_rounding() {
        assert_eq!(bytes_to_gib_ceil(16 * 1024 * 1024), 1);
        assert_eq!(bytes_to_gib_ceil(GIB), 1);
        assert_eq!(bytes_to_gib_ceil(GIB + 1), 2);
        assert_eq!(bytes_to_gib_ceil(0), 0);
    }
}
