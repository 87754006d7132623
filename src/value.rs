// Values and port types
//
// Everything that flows over the address bus or through block ports is one of
// these tagged values. Port types are a closed tag set; coercion between the
// wire form, the typed form and a port's declared type is defined here and
// nowhere else.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Error, Result};

/// A bus/port value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    Null,
}

/// Data types a block port can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    Bool,
    Int,
    #[serde(alias = "float")]
    Real,
    #[serde(alias = "str")]
    String,
    Any,
}

impl PortType {
    /// Zero value used when a port has neither a delivered value nor a default.
    pub fn zero(&self) -> Value {
        match self {
            PortType::Bool => Value::Bool(false),
            PortType::Int => Value::Int(0),
            PortType::Real => Value::Real(0.0),
            PortType::String => Value::Str(String::new()),
            PortType::Any => Value::Null,
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Real(r) => *r != 0.0,
            Value::Str(s) => truthy_str(s),
            Value::Null => false,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Bool(b) => *b as i64,
            Value::Int(i) => *i,
            Value::Real(r) => *r as i64,
            Value::Str(s) => s.trim().parse::<f64>().map(|f| f as i64).unwrap_or(0),
            Value::Null => 0,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Bool(b) => *b as i64 as f64,
            Value::Int(i) => *i as f64,
            Value::Real(r) => *r,
            Value::Str(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            Value::Null => 0.0,
        }
    }

    /// Numeric view, if this value has one. Strings only count when they parse
    /// completely as a number; `"true"` does not.
    fn numeric(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(*b as i64 as f64),
            Value::Int(i) => Some(*i as f64),
            Value::Real(r) => Some(*r),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
            Value::Null => None,
        }
    }

    /// Coerce into the declared port type. Errors only where no sensible
    /// conversion exists (non-numeric string into a numeric port).
    pub fn coerce(&self, ty: PortType) -> Result<Value> {
        match ty {
            PortType::Any => Ok(self.clone()),
            PortType::Bool => Ok(Value::Bool(self.as_bool())),
            PortType::Int => match self {
                Value::Str(s) if !s.trim().is_empty() && s.trim().parse::<f64>().is_err() => {
                    Err(Error::TypeCoercion(format!("'{s}' is not an int")))
                }
                Value::Null => Ok(Value::Int(0)),
                other => Ok(Value::Int(other.as_i64())),
            },
            PortType::Real => match self {
                Value::Str(s) if !s.trim().is_empty() && s.trim().parse::<f64>().is_err() => {
                    Err(Error::TypeCoercion(format!("'{s}' is not a number")))
                }
                Value::Null => Ok(Value::Real(0.0)),
                other => Ok(Value::Real(other.as_f64())),
            },
            PortType::String => Ok(match self {
                Value::Null => Value::Str(String::new()),
                other => Value::Str(other.to_wire()),
            }),
        }
    }

    /// Equality after coercion to the given port type. This is what change
    /// detection uses: `true` and `1` are equal on a bool port, `"1"` and `1`
    /// on any numeric port, and the empty string stays distinct from null.
    pub fn coerced_eq(a: &Value, b: &Value, ty: PortType) -> bool {
        match ty {
            PortType::Any => Value::loose_eq(a, b),
            _ => match (a.coerce(ty), b.coerce(ty)) {
                (Ok(ca), Ok(cb)) => ca == cb,
                _ => a == b,
            },
        }
    }

    /// Untyped cross-type equality: numeric values compare numerically
    /// (bool as 0/1, numeric strings parsed), otherwise same-variant compare.
    pub fn loose_eq(a: &Value, b: &Value) -> bool {
        match (a.numeric(), b.numeric()) {
            (Some(na), Some(nb)) => na == nb,
            _ => match (a, b) {
                (Value::Str(x), Value::Str(y)) => x == y,
                (Value::Null, Value::Null) => true,
                (Value::Bool(x), Value::Bool(y)) => x == y,
                _ => false,
            },
        }
    }

    /// Textual wire form: booleans as `0|1`, reals with `.`, strings verbatim.
    pub fn to_wire(&self) -> String {
        match self {
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Real(r) => {
                let s = r.to_string();
                if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
                    s
                } else {
                    format!("{s}.0")
                }
            }
            Value::Str(s) => s.clone(),
            Value::Null => String::new(),
        }
    }

    /// Parse wire text into a typed value, using the address's DPT hint when
    /// there is one, otherwise by shape: on/off and true/false become
    /// booleans, clean integers stay integers, the rest falls through to
    /// real and finally string.
    pub fn parse_text(s: &str, dpt: Option<&str>) -> Value {
        if let Some(dpt) = dpt {
            let main = dpt.split('.').next().unwrap_or(dpt);
            match main {
                "1" => return Value::Bool(truthy_str(s)),
                "5" | "6" | "7" | "8" | "12" | "13" => {
                    if let Ok(i) = s.trim().parse::<i64>() {
                        return Value::Int(i);
                    }
                }
                "9" | "14" => {
                    if let Ok(r) = s.trim().parse::<f64>() {
                        return Value::Real(r);
                    }
                }
                "16" => return Value::Str(s.to_string()),
                _ => {}
            }
        }
        let t = s.trim();
        match t.to_ascii_lowercase().as_str() {
            "true" | "on" => return Value::Bool(true),
            "false" | "off" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(i) = t.parse::<i64>() {
            if i.to_string() == t {
                return Value::Int(i);
            }
        }
        if let Ok(r) = t.parse::<f64>() {
            return Value::Real(r);
        }
        Value::Str(s.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

fn truthy_str(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "ein"
    ) || s.trim().parse::<f64>().map(|f| f != 0.0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_bool() {
        for v in [
            Value::Bool(true),
            Value::Int(1),
            Value::Real(1.0),
            Value::Str("1".into()),
            Value::Str("true".into()),
            Value::Str("on".into()),
        ] {
            assert_eq!(v.coerce(PortType::Bool).unwrap(), Value::Bool(true), "{v:?}");
        }
        assert_eq!(
            Value::Str("off".into()).coerce(PortType::Bool).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(Value::Null.coerce(PortType::Bool).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_coerce_numeric() {
        assert_eq!(Value::Str("21.5".into()).coerce(PortType::Real).unwrap(), Value::Real(21.5));
        assert_eq!(Value::Str("7".into()).coerce(PortType::Int).unwrap(), Value::Int(7));
        assert_eq!(Value::Real(3.9).coerce(PortType::Int).unwrap(), Value::Int(3));
        assert!(Value::Str("abc".into()).coerce(PortType::Real).is_err());
    }

    #[test]
    fn test_coerced_eq_rules() {
        assert!(Value::coerced_eq(&Value::Bool(true), &Value::Int(1), PortType::Bool));
        assert!(Value::coerced_eq(&Value::Str("1".into()), &Value::Int(1), PortType::Any));
        assert!(Value::coerced_eq(&Value::Int(1), &Value::Real(1.0), PortType::Any));
        // "true" is only equal to 1 on a bool port, never on an any port
        assert!(Value::coerced_eq(&Value::Str("true".into()), &Value::Int(1), PortType::Bool));
        assert!(!Value::coerced_eq(&Value::Str("true".into()), &Value::Int(1), PortType::Any));
        // empty string is distinct from null
        assert!(!Value::coerced_eq(&Value::Str(String::new()), &Value::Null, PortType::Any));
    }

    #[test]
    fn test_wire_roundtrip() {
        assert_eq!(Value::Bool(true).to_wire(), "1");
        assert_eq!(Value::Real(2.0).to_wire(), "2.0");
        assert_eq!(Value::parse_text("1", Some("1")), Value::Bool(true));
        assert_eq!(Value::parse_text("21.5", None), Value::Real(21.5));
        assert_eq!(Value::parse_text("42", None), Value::Int(42));
        assert_eq!(Value::parse_text("hello", None), Value::Str("hello".into()));
    }

    #[test]
    fn test_untagged_json() {
        let v: Value = serde_json::from_str("true").unwrap();
        assert_eq!(v, Value::Bool(true));
        let v: Value = serde_json::from_str("3.5").unwrap();
        assert_eq!(v, Value::Real(3.5));
        let v: Value = serde_json::from_str("null").unwrap();
        assert_eq!(v, Value::Null);
        assert_eq!(serde_json::to_string(&Value::Int(4)).unwrap(), "4");
    }
}
