// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Display formatting for on-chain integers and durations.
//!
//! Everything here works on the decimal digit string of the raw value, so no
//! precision is lost for 256-bit amounts and no floating point is involved.

use ethers::types::U256;

/// Fractional digits shown when the caller does not ask for something else.
pub const DEFAULT_DISPLAY_PRECISION: usize = 2;

/// Decimals assumed when a token's `decimals()` read cannot be resolved.
pub const FALLBACK_DECIMALS: u8 = 18;

/// Unit label used for vault share amounts.
pub const SHARES_UNIT: &str = "shares";

/// Formats `raw / 10^decimals` with exactly `precision` fractional digits,
/// rounding half-up.
pub fn format_units_fixed(raw: U256, decimals: u8, precision: usize) -> String {
    let decimals = decimals as usize;
    let mut digits = raw.to_string();
    if digits.len() <= decimals {
        digits = format!("{}{}", "0".repeat(decimals + 1 - digits.len()), digits);
    }
    let split = digits.len() - decimals;
    let (int_part, frac_part) = digits.split_at(split);

    let (int_part, frac_part) = if precision >= decimals {
        (
            int_part.to_string(),
            format!("{}{}", frac_part, "0".repeat(precision - decimals)),
        )
    } else {
        let kept = format!("{}{}", int_part, &frac_part[..precision]);
        let round_up = frac_part.as_bytes()[precision] >= b'5';
        let kept = if round_up {
            increment_decimal(&kept)
        } else {
            kept
        };
        let split = kept.len() - precision;
        (kept[..split].to_string(), kept[split..].to_string())
    };

    if precision == 0 {
        int_part
    } else {
        format!("{}.{}", int_part, frac_part)
    }
}

/// `format_units_fixed` followed by a unit label, e.g. `"1.00 USDC"`.
pub fn format_amount(raw: U256, decimals: u8, precision: usize, unit: &str) -> String {
    format!("{} {}", format_units_fixed(raw, decimals, precision), unit)
}

// Adds one to a non-empty string of ASCII digits.
fn increment_decimal(digits: &str) -> String {
    let mut bytes = digits.as_bytes().to_vec();
    for byte in bytes.iter_mut().rev() {
        if *byte == b'9' {
            *byte = b'0';
        } else {
            *byte += 1;
            return String::from_utf8(bytes).unwrap_or_default();
        }
    }
    let mut carried = String::with_capacity(bytes.len() + 1);
    carried.push('1');
    carried.push_str(&String::from_utf8(bytes).unwrap_or_default());
    carried
}

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

/// Formats a remaining duration as `HH:MM:SS`, or `DD:HH:MM:SS` once at least
/// one full day remains. Sub-second remainders are truncated.
pub fn format_time_remaining(remaining_ms: u64) -> String {
    let total = remaining_ms / 1000;
    let days = total / SECS_PER_DAY;
    let hours = (total % SECS_PER_DAY) / SECS_PER_HOUR;
    let minutes = (total % SECS_PER_HOUR) / SECS_PER_MINUTE;
    let seconds = total % SECS_PER_MINUTE;
    if days > 0 {
        format!("{:02}:{:02}:{:02}:{:02}", days, hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    }
}
