// KNX datapoint type transcoding
//
// Converts between typed bus values and the raw payload bytes of group
// telegrams. Only the main DPT number decides the layout; sub-numbers refine
// scaling (5.001 is a percentage over 0..255).

use crate::types::{Error, Result};
use crate::value::Value;

/// Decode a raw group payload using the address's DPT hint.
pub fn decode(raw: &[u8], dpt: &str) -> Option<Value> {
    let main = dpt.split('.').next().unwrap_or(dpt);
    match main {
        "1" => raw.first().map(|b| Value::Bool(b & 0x01 != 0)),
        "5" => raw.first().map(|&b| {
            if dpt == "5.001" {
                Value::Real((b as f64 * 100.0 / 255.0 * 10.0).round() / 10.0)
            } else {
                Value::Int(b as i64)
            }
        }),
        "6" => raw.first().map(|&b| Value::Int(b as i8 as i64)),
        "7" => (raw.len() >= 2).then(|| Value::Int(u16::from_be_bytes([raw[0], raw[1]]) as i64)),
        "8" => (raw.len() >= 2).then(|| Value::Int(i16::from_be_bytes([raw[0], raw[1]]) as i64)),
        "9" => (raw.len() >= 2).then(|| Value::Real(decode_f16(raw[0], raw[1]))),
        "12" => (raw.len() >= 4)
            .then(|| Value::Int(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64)),
        "13" => (raw.len() >= 4)
            .then(|| Value::Int(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64)),
        "14" => (raw.len() >= 4).then(|| {
            let v = f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64;
            Value::Real((v * 10000.0).round() / 10000.0)
        }),
        "16" => Some(Value::Str(
            String::from_utf8_lossy(raw)
                .trim_end_matches('\0')
                .to_string(),
        )),
        _ => None,
    }
}

/// Encode a value for the given DPT. Fails with a coercion error when the
/// value is not representable in that layout.
pub fn encode(value: &Value, dpt: &str) -> Result<Vec<u8>> {
    let main = dpt.split('.').next().unwrap_or(dpt);
    let err = || Error::TypeCoercion(format!("{value} not representable as DPT {dpt}"));
    match main {
        "1" => Ok(vec![value.as_bool() as u8]),
        "5" => {
            let v = if dpt == "5.001" {
                (value.as_f64() * 255.0 / 100.0).round()
            } else {
                value.as_f64().round()
            };
            if !(0.0..=255.0).contains(&v) || !numeric_like(value) {
                return Err(err());
            }
            Ok(vec![v as u8])
        }
        "6" => int_bytes(value, -128, 127).map(|v| vec![v as i8 as u8]).ok_or_else(err),
        "7" => int_bytes(value, 0, 65535)
            .map(|v| (v as u16).to_be_bytes().to_vec())
            .ok_or_else(err),
        "8" => int_bytes(value, -32768, 32767)
            .map(|v| (v as i16).to_be_bytes().to_vec())
            .ok_or_else(err),
        "9" => {
            if !numeric_like(value) {
                return Err(err());
            }
            encode_f16(value.as_f64()).map(|(a, b)| vec![a, b]).ok_or_else(err)
        }
        "12" => int_bytes(value, 0, u32::MAX as i64)
            .map(|v| (v as u32).to_be_bytes().to_vec())
            .ok_or_else(err),
        "13" => int_bytes(value, i32::MIN as i64, i32::MAX as i64)
            .map(|v| (v as i32).to_be_bytes().to_vec())
            .ok_or_else(err),
        "14" => {
            if !numeric_like(value) {
                return Err(err());
            }
            Ok((value.as_f64() as f32).to_be_bytes().to_vec())
        }
        "16" => {
            let mut bytes = value.to_wire().into_bytes();
            bytes.truncate(14);
            bytes.resize(14, 0);
            Ok(bytes)
        }
        _ => Ok(encode_untyped(value)),
    }
}

/// Encode without a DPT hint: booleans and 0/1 integers as one-bit payloads,
/// other integers as 16-bit, reals as KNX float.
pub fn encode_untyped(value: &Value) -> Vec<u8> {
    match value {
        Value::Bool(b) => vec![*b as u8],
        Value::Int(i) if *i == 0 || *i == 1 => vec![*i as u8],
        Value::Int(i) => (*i as i16).to_be_bytes().to_vec(),
        Value::Real(r) => encode_f16(*r).map(|(a, b)| vec![a, b]).unwrap_or_default(),
        Value::Str(s) => s.clone().into_bytes(),
        Value::Null => vec![0],
    }
}

fn numeric_like(value: &Value) -> bool {
    match value {
        Value::Bool(_) | Value::Int(_) | Value::Real(_) => true,
        Value::Str(s) => s.trim().parse::<f64>().is_ok(),
        Value::Null => false,
    }
}

fn int_bytes(value: &Value, min: i64, max: i64) -> Option<i64> {
    if !numeric_like(value) {
        return None;
    }
    let v = value.as_f64().round() as i64;
    (min..=max).contains(&v).then_some(v)
}

/// KNX 2-byte float: sign + 4-bit exponent + 11-bit mantissa, 0.01 resolution.
fn decode_f16(b0: u8, b1: u8) -> f64 {
    let sign = b0 >> 7 & 0x01;
    let exp = (b0 >> 3 & 0x0f) as i32;
    let mut mant = (((b0 & 0x07) as i32) << 8) | b1 as i32;
    if sign == 1 {
        mant -= 2048;
    }
    let v = 0.01 * mant as f64 * f64::powi(2.0, exp);
    (v * 100.0).round() / 100.0
}

fn encode_f16(value: f64) -> Option<(u8, u8)> {
    if !value.is_finite() {
        return None;
    }
    let mut mant = (value * 100.0).round();
    let mut exp = 0u8;
    while !(-2048.0..=2047.0).contains(&mant) {
        mant /= 2.0;
        exp += 1;
        if exp > 15 {
            return None;
        }
    }
    let mant = mant.round() as i32;
    let stored = if mant < 0 { mant + 2048 } else { mant } as u16;
    let sign = (mant < 0) as u8;
    let b0 = (sign << 7) | (exp << 3) | ((stored >> 8) as u8 & 0x07);
    let b1 = (stored & 0xff) as u8;
    Some((b0, b1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dpt1_roundtrip() {
        assert_eq!(encode(&Value::Bool(true), "1").unwrap(), vec![1]);
        assert_eq!(decode(&[1], "1.001"), Some(Value::Bool(true)));
        assert_eq!(decode(&[0], "1"), Some(Value::Bool(false)));
    }

    #[test]
    fn test_dpt9_roundtrip() {
        for v in [21.0, -5.5, 0.0, 670000.0, -272.96] {
            let (a, b) = encode_f16(v).unwrap();
            let back = decode_f16(a, b);
            assert!((back - v).abs() <= v.abs() * 0.01 + 0.01, "{v} -> {back}");
        }
    }

    #[test]
    fn test_dpt9_known_bytes() {
        // 21.0 C: exp 1, mantissa 1050
        assert_eq!(encode_f16(21.0), Some((0x0c, 0x1a)));
        assert_eq!(decode_f16(0x0c, 0x1a), 21.0);
    }

    #[test]
    fn test_dpt5_percentage() {
        assert_eq!(encode(&Value::Int(100), "5.001").unwrap(), vec![255]);
        assert_eq!(decode(&[255], "5.001"), Some(Value::Real(100.0)));
        assert_eq!(decode(&[128], "5"), Some(Value::Int(128)));
    }

    #[test]
    fn test_unrepresentable() {
        assert!(encode(&Value::Str("hello".into()), "9").is_err());
        assert!(encode(&Value::Int(4711), "5").is_err());
        assert!(encode(&Value::Int(-1), "7").is_err());
    }

    #[test]
    fn test_untyped_heuristic() {
        assert_eq!(encode_untyped(&Value::Bool(true)), vec![1]);
        assert_eq!(encode_untyped(&Value::Int(1)), vec![1]);
        assert_eq!(encode_untyped(&Value::Int(300)), vec![0x01, 0x2c]);
    }
}
