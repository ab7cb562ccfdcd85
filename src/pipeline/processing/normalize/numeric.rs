//! Lenient numeric parsing for decorated source values ("$1,200.50", "-500_", "(42)").

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

static PLAIN_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d*\.?\d*$").expect("valid regex"));

/// Outcome of a lenient numeric parse
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedNumber {
    pub value: Decimal,
    /// True when decoration had to be stripped to obtain the number
    pub decorated: bool,
}

/// Parse a JSON value into an exact decimal, stripping currency symbols, thousands separators,
/// stray underscores and accounting-style parentheses.
pub fn parse_decorated_decimal(value: &Value) -> Result<ParsedNumber, String> {
    match value {
        Value::Number(n) => {
            let text = n.to_string();
            parse_plain(&text)
                .map(|value| ParsedNumber {
                    value,
                    decorated: false,
                })
                .ok_or_else(|| format!("number '{}' is not representable", text))
        }
        Value::String(s) => parse_decorated_str(s),
        Value::Null => Err("value is null".to_string()),
        other => Err(format!("expected a number, found {}", json_kind(other))),
    }
}

pub fn parse_decorated_str(raw: &str) -> Result<ParsedNumber, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty string".to_string());
    }
    if let Some(value) = parse_plain(trimmed) {
        return Ok(ParsedNumber {
            value,
            decorated: false,
        });
    }

    let mut body = trimmed;
    let mut negative = false;
    if body.starts_with('(') && body.ends_with(')') && body.len() > 2 {
        negative = true;
        body = &body[1..body.len() - 1];
    }

    // Leading decoration: currency symbols, codes, whitespace
    body = body.trim_start_matches(|c: char| !(c.is_ascii_digit() || matches!(c, '-' | '+' | '.')));
    if let Some(rest) = body.strip_prefix('-') {
        negative = !negative;
        body = rest;
    } else if let Some(rest) = body.strip_prefix('+') {
        body = rest;
    }
    body = body.trim_start_matches(|c: char| !(c.is_ascii_digit() || c == '.'));
    // Trailing decoration: underscores, percent signs, currency codes
    body = body.trim_end_matches(|c: char| !(c.is_ascii_digit() || c == '.'));

    let digits: String = body
        .chars()
        .filter(|c| !matches!(c, ',' | '_' | ' '))
        .collect();
    if !digits.chars().any(|c| c.is_ascii_digit()) || !PLAIN_NUMBER.is_match(&digits) {
        return Err(format!("'{}' is not numeric", raw));
    }

    let value = parse_plain(&digits).ok_or_else(|| format!("'{}' is not numeric", raw))?;
    Ok(ParsedNumber {
        value: if negative { -value } else { value },
        decorated: true,
    })
}

/// Convert a configured float bound into a decimal without going through binary rounding
pub fn decimal_from_f64(x: f64) -> Option<Decimal> {
    if !x.is_finite() {
        return None;
    }
    parse_plain(&x.to_string())
}

fn parse_plain(text: &str) -> Option<Decimal> {
    // Decimal::from_str tolerates '_' separators, which must count as decoration here
    if !text
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
    {
        return None;
    }
    let mut t = text.to_string();
    if t.ends_with('.') {
        t.pop();
    }
    if t.starts_with('.') {
        t.insert(0, '0');
    } else if t.starts_with("-.") {
        t.insert(1, '0');
    }
    Decimal::from_str(&t)
        .or_else(|_| Decimal::from_scientific(&t))
        .ok()
        .map(|d| d.normalize())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
