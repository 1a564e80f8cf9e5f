//! Human-readable size strings.
//!
//! Converts strings like `1G`, `512MB` or `1GiB` to bytes and back. All
//! multipliers are binary (1024-based); `1G`, `1GB` and `1GiB` are the same
//! quantity.

use thiserror::Error;

/// Result type for size parsing.
pub type SizeResult<T> = Result<T, SizeError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    /// Empty input, unparsable number or unknown unit.
    #[error("invalid size: {0}")]
    InvalidSize(String),

    /// The value does not fit in a u64.
    #[error("size exceeds maximum representable value: {0}")]
    SizeOverflow(String),
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

fn multiplier(unit: &str) -> Option<u64> {
    match unit {
        "" | "B" | "BYTES" => Some(1),
        "K" | "KB" | "KIB" => Some(KIB),
        "M" | "MB" | "MIB" => Some(MIB),
        "G" | "GB" | "GIB" => Some(GIB),
        "T" | "TB" | "TIB" => Some(TIB),
        _ => None,
    }
}

/// Parse a size string of the form `<number>[.<fraction>][ ]?<unit>`.
///
/// The unit is case-insensitive; an empty unit and `B`/`BYTES` mean bytes.
pub fn parse_size(input: &str) -> SizeResult<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SizeError::InvalidSize("empty size string".to_string()));
    }

    let upper = trimmed.to_ascii_uppercase();
    let split = upper
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(upper.len());
    let (number, unit) = upper.split_at(split);
    let unit = unit.trim_start();

    let mult = multiplier(unit).ok_or_else(|| SizeError::InvalidSize(input.to_string()))?;

    if number.is_empty() {
        return Err(SizeError::InvalidSize(input.to_string()));
    }

    // Integer fast path keeps exact values (e.g. 2^63) that f64 would round.
    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(mult)
            .ok_or_else(|| SizeError::SizeOverflow(input.to_string()));
    }

    let value: f64 = number
        .parse()
        .map_err(|_| SizeError::InvalidSize(input.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(SizeError::InvalidSize(input.to_string()));
    }

    let bytes = value * mult as f64;
    if bytes > u64::MAX as f64 {
        return Err(SizeError::SizeOverflow(input.to_string()));
    }

    Ok(bytes as u64)
}

/// Render a byte count using the largest binary unit that divides it evenly.
///
/// The output parses back to the same value: `parse_size(&format_size(x)) == Ok(x)`.
pub fn format_size(bytes: u64) -> String {
    for (unit, mult) in [("T", TIB), ("G", GIB), ("M", MIB), ("K", KIB)] {
        if bytes >= mult && bytes % mult == 0 {
            return format!("{}{}", bytes / mult, unit);
        }
    }
    bytes.to_string()
}
