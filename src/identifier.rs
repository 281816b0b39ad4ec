// 🔢 Entity Identifiers - cleaning, padding, check digits
//
// An entity identifier is 14 digits. Sources publish it formatted
// ("12.345.678/0001-90"), unformatted, or with leading zeros stripped, so
// every comparison and join goes through `normalize_identifier` first.

use anyhow::{anyhow, Result};

pub const IDENTIFIER_LEN: usize = 14;

const FIRST_WEIGHTS: [u32; 12] = [5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];
const SECOND_WEIGHTS: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

/// Keep only ASCII digits. Idempotent.
///
/// ```
/// use operator_expenses::identifier::clean_identifier;
/// assert_eq!(clean_identifier("12.345.678/0001-90"), "12345678000190");
/// ```
pub fn clean_identifier(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Clean and left-pad with zeros to 14 characters. Empty stays empty.
pub fn normalize_identifier(raw: &str) -> String {
    let digits = clean_identifier(raw);
    if digits.is_empty() || digits.len() >= IDENTIFIER_LEN {
        return digits;
    }
    format!("{:0>width$}", digits, width = IDENTIFIER_LEN)
}

/// Weighted-sum mod 11 check digit
fn check_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    let rest = sum % 11;
    if rest < 2 {
        0
    } else {
        11 - rest
    }
}

/// Full validity: 14 digits, not all identical, both check digits match.
pub fn is_valid_identifier(id: &str) -> bool {
    if id.len() != IDENTIFIER_LEN || !id.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }

    let digits: Vec<u32> = id.chars().filter_map(|c| c.to_digit(10)).collect();

    if digits.iter().all(|d| *d == digits[0]) {
        return false;
    }

    let first = check_digit(&digits[..12], &FIRST_WEIGHTS);
    if digits[12] != first {
        return false;
    }

    let second = check_digit(&digits[..13], &SECOND_WEIGHTS);
    digits[13] == second
}

/// Render as XX.XXX.XXX/XXXX-XX
pub fn format_identifier(raw: &str) -> Result<String> {
    let id = clean_identifier(raw);
    if id.len() != IDENTIFIER_LEN {
        return Err(anyhow!(
            "identifier must have {} digits, got {}",
            IDENTIFIER_LEN,
            id.len()
        ));
    }
    Ok(format!(
        "{}.{}.{}/{}-{}",
        &id[..2],
        &id[2..5],
        &id[5..8],
        &id[8..12],
        &id[12..]
    ))
}

/// Trim, upper-case and collapse inner whitespace so names compare loosely
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}
