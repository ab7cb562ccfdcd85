use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::pipeline::processing::normalize::numeric::{decimal_from_f64, parse_decorated_decimal};

/// A single field-level check. Implement this to plug custom rules into the gate.
///
/// `value` is `None` when the field is absent from the record.
pub trait FieldCheck: Send + Sync + fmt::Debug {
    fn check(&self, value: Option<&Value>) -> std::result::Result<(), String>;

    /// Short human-readable form, used in logs and audit output
    fn describe(&self) -> String;
}

/// Declarative predicate as it appears in the rule configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    NotNull,
    Numeric,
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    OneOf {
        values: Vec<String>,
        #[serde(default)]
        case_insensitive: bool,
    },
    Matches {
        pattern: String,
    },
    MaxLength {
        max: usize,
    },
}

impl Predicate {
    pub fn compile(&self) -> Result<Arc<dyn FieldCheck>> {
        Ok(match self {
            Predicate::NotNull => Arc::new(NotNull),
            Predicate::Numeric => Arc::new(Numeric),
            Predicate::Range { min, max } => {
                if min.is_none() && max.is_none() {
                    return Err(PipelineError::Config(
                        "range predicate needs at least one of min/max".to_string(),
                    ));
                }
                Arc::new(InRange {
                    min: min.and_then(decimal_from_f64),
                    max: max.and_then(decimal_from_f64),
                })
            }
            Predicate::OneOf {
                values,
                case_insensitive,
            } => Arc::new(OneOf {
                values: values
                    .iter()
                    .map(|v| fold(v.trim(), *case_insensitive))
                    .collect(),
                case_insensitive: *case_insensitive,
            }),
            Predicate::Matches { pattern } => Arc::new(Matches {
                regex: Regex::new(pattern)
                    .map_err(|e| PipelineError::Config(format!("invalid rule pattern '{}': {}", pattern, e)))?,
            }),
            Predicate::MaxLength { max } => Arc::new(MaxLength { max: *max }),
        })
    }
}

fn is_null(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        _ => false,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn fold(s: &str, case_insensitive: bool) -> String {
    if case_insensitive {
        s.to_lowercase()
    } else {
        s.to_string()
    }
}

#[derive(Debug)]
struct NotNull;

impl FieldCheck for NotNull {
    fn check(&self, value: Option<&Value>) -> std::result::Result<(), String> {
        if is_null(value) {
            Err("value is null or missing".to_string())
        } else {
            Ok(())
        }
    }

    fn describe(&self) -> String {
        "not null".to_string()
    }
}

#[derive(Debug)]
struct Numeric;

impl FieldCheck for Numeric {
    fn check(&self, value: Option<&Value>) -> std::result::Result<(), String> {
        match value {
            Some(v) if !is_null(Some(v)) => parse_decorated_decimal(v).map(|_| ()),
            _ => Ok(()),
        }
    }

    fn describe(&self) -> String {
        "numeric".to_string()
    }
}

#[derive(Debug)]
struct InRange {
    min: Option<Decimal>,
    max: Option<Decimal>,
}

impl FieldCheck for InRange {
    fn check(&self, value: Option<&Value>) -> std::result::Result<(), String> {
        let Some(v) = value.filter(|v| !is_null(Some(v))) else {
            return Ok(());
        };
        let n = parse_decorated_decimal(v)?.value;
        if let Some(min) = self.min {
            if n < min {
                return Err(format!("{} is below minimum {}", n, min));
            }
        }
        if let Some(max) = self.max {
            if n > max {
                return Err(format!("{} is above maximum {}", n, max));
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        let bound = |b: Option<Decimal>| b.map(|d| d.to_string()).unwrap_or_else(|| "*".to_string());
        format!("in range [{}, {}]", bound(self.min), bound(self.max))
    }
}

#[derive(Debug)]
struct OneOf {
    values: HashSet<String>,
    case_insensitive: bool,
}

impl FieldCheck for OneOf {
    fn check(&self, value: Option<&Value>) -> std::result::Result<(), String> {
        let Some(v) = value.filter(|v| !is_null(Some(v))) else {
            return Ok(());
        };
        let text = as_text(v);
        if self.values.contains(&fold(&text, self.case_insensitive)) {
            Ok(())
        } else {
            Err(format!("'{}' is not an allowed value", text))
        }
    }

    fn describe(&self) -> String {
        let mut values: Vec<&String> = self.values.iter().collect();
        values.sort();
        format!("one of {:?}", values)
    }
}

#[derive(Debug)]
struct Matches {
    regex: Regex,
}

impl FieldCheck for Matches {
    fn check(&self, value: Option<&Value>) -> std::result::Result<(), String> {
        let Some(v) = value.filter(|v| !is_null(Some(v))) else {
            return Ok(());
        };
        let text = as_text(v);
        if self.regex.is_match(&text) {
            Ok(())
        } else {
            Err(format!("'{}' does not match /{}/", text, self.regex.as_str()))
        }
    }

    fn describe(&self) -> String {
        format!("matches /{}/", self.regex.as_str())
    }
}

#[derive(Debug)]
struct MaxLength {
    max: usize,
}

impl FieldCheck for MaxLength {
    fn check(&self, value: Option<&Value>) -> std::result::Result<(), String> {
        let Some(v) = value.filter(|v| !is_null(Some(v))) else {
            return Ok(());
        };
        let len = as_text(v).chars().count();
        if len > self.max {
            Err(format!("length {} exceeds {}", len, self.max))
        } else {
            Ok(())
        }
    }

    fn describe(&self) -> String {
        format!("at most {} characters", self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(p: Predicate, v: Value) -> std::result::Result<(), String> {
        p.compile().unwrap().check(Some(&v))
    }

    #[test]
    fn null_passes_everything_but_not_null() {
        let predicates = vec![
            Predicate::Numeric,
            Predicate::Range { min: Some(0.0), max: None },
            Predicate::OneOf { values: vec!["a".into()], case_insensitive: false },
            Predicate::Matches { pattern: "^x$".into() },
            Predicate::MaxLength { max: 1 },
        ];
        for p in predicates {
            assert!(p.compile().unwrap().check(None).is_ok());
            assert!(check(p, Value::Null).is_ok());
        }
        assert!(Predicate::NotNull.compile().unwrap().check(None).is_err());
        assert!(check(Predicate::NotNull, json!("   ")).is_err());
    }

    #[test]
    fn range_parses_decorated_numbers() {
        let p = Predicate::Range { min: Some(0.0), max: Some(100.0) };
        assert!(check(p.clone(), json!("42_")).is_ok());
        assert!(check(p.clone(), json!(-1)).is_err());
        assert!(check(p.clone(), json!("7000")).is_err());
        assert!(check(p, json!("abc")).is_err());
    }

    #[test]
    fn one_of_honours_case_setting() {
        let strict = Predicate::OneOf { values: vec!["Good".into()], case_insensitive: false };
        let loose = Predicate::OneOf { values: vec!["Good".into()], case_insensitive: true };
        assert!(check(strict, json!("good")).is_err());
        assert!(check(loose, json!(" good ")).is_ok());
    }

    #[test]
    fn matches_and_max_length() {
        assert!(check(Predicate::Matches { pattern: r"^CUS_\w+$".into() }, json!("CUS_0xd40")).is_ok());
        assert!(check(Predicate::Matches { pattern: r"^CUS_\w+$".into() }, json!("0xd40")).is_err());
        assert!(check(Predicate::MaxLength { max: 3 }, json!("abcd")).is_err());
    }

    #[test]
    fn empty_range_is_a_config_error() {
        assert!(Predicate::Range { min: None, max: None }.compile().is_err());
        assert!(Predicate::Matches { pattern: "(".into() }.compile().is_err());
    }
}
