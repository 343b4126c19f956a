//! Kubernetes quantity strings
//!
//! `128974848`, `129e6`, `129M`, `123Mi`, `100m`, `1.5Gi`. Binary suffixes are
//! powers of 1024, decimal suffixes powers of 1000, `m`/`u`/`n` are fractions.

use serde_json::Value;
use tracing::warn;

const BINARY_SUFFIXES: [(&str, i32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, i32); 9] = [
    ("n", -3),
    ("u", -2),
    ("m", -1),
    ("k", 1),
    ("K", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
];

/// Parse a quantity string into a number
pub fn parse_quantity(input: &str) -> Option<f64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    for (suffix, power) in BINARY_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return parse_number(number).map(|n| scale(n, 1024.0, power));
        }
    }

    // "E" alone is exa; "1E3" style exponents are handled by parse_number below
    if let Some(number) = s.strip_suffix('E') {
        if let Some(n) = parse_number(number) {
            return Some(scale(n, 1000.0, 6));
        }
    }

    for (suffix, power) in DECIMAL_SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return parse_number(number).map(|n| scale(n, 1000.0, power));
        }
    }

    parse_number(s)
}

// Fractions divide so that "100m" lands exactly on 0.1
fn scale(n: f64, base: f64, power: i32) -> f64 {
    if power >= 0 {
        n * base.powi(power)
    } else {
        n / base.powi(-power)
    }
}

fn parse_number(s: &str) -> Option<f64> {
    if s.is_empty() || s.contains(char::is_whitespace) {
        return None;
    }
    s.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Parse a quantity into a JSON value, failing soft
///
/// Unparseable input is logged and becomes null; it never aborts the pass.
pub fn quantity_value(field: &str, owner: &str, input: Option<&str>) -> Value {
    let Some(raw) = input else {
        return Value::Null;
    };
    match parse_quantity(raw) {
        Some(n) => number_value(n),
        None => {
            warn!(
                field = %field,
                owner = %owner,
                value = %raw,
                "Unparseable quantity, storing null"
            );
            Value::Null
        }
    }
}

/// Integral values become JSON integers so they compare stably across passes
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}
