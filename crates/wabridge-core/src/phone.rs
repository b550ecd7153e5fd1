//! Phone number normalisation.
//!
//! Phones are compared on their stripped form only: `+`, `-` and spaces are
//! removed and nothing else is interpreted. No locale-aware parsing happens
//! here on purpose; the same digits typed with different punctuation must map
//! to the same identity.

use crate::error::{Error, Result};

/// Shortest accepted phone, in digits.
pub const MIN_DIGITS: usize = 10;

/// Longest accepted phone, in digits.
pub const MAX_DIGITS: usize = 15;

/// Strip the separator characters (`+`, `-`, space).
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '+' | '-' | ' '))
        .collect()
}

/// Normalise and validate a phone typed by an operator.
///
/// The stripped value must consist of ASCII digits only and be between
/// [`MIN_DIGITS`] and [`MAX_DIGITS`] long.
pub fn validate(raw: &str) -> Result<String> {
    let phone = normalize(raw);
    if phone.is_empty() {
        return Err(Error::InvalidPhone {
            phone,
            reason: "empty",
        });
    }
    if !phone.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidPhone {
            phone,
            reason: "must contain digits only",
        });
    }
    if !(MIN_DIGITS..=MAX_DIGITS).contains(&phone.len()) {
        return Err(Error::InvalidPhone {
            phone,
            reason: "must be 10 to 15 digits long",
        });
    }
    Ok(phone)
}
