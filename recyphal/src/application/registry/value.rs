//! Register values and coercion
//!
//! A register value is a discriminated union over the protocol scalar
//! families, each carried as a vector (a scalar is a one-element vector).
//! Coercion converts a written value into the register's own type while
//! preserving every element's value exactly; any lossy conversion fails.
//! Numeric families (integers of both signs and all widths, both float
//! widths) convert freely among each other under that rule; bit, string
//! and byte-array values only convert within their own family.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

/// A register value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Empty,
    Bit(Vec<bool>),
    String(String),
    Unstructured(Vec<u8>),
    Integer8(Vec<i8>),
    Integer16(Vec<i16>),
    Integer32(Vec<i32>),
    Integer64(Vec<i64>),
    Natural8(Vec<u8>),
    Natural16(Vec<u16>),
    Natural32(Vec<u32>),
    Natural64(Vec<u64>),
    Real32(Vec<f32>),
    Real64(Vec<f64>),
}

/// Exact intermediate representation of one numeric element.
#[derive(Debug, Clone, Copy)]
enum WideNum {
    Int(i128),
    Float(f64),
}

impl Value {
    /// Converts `self` into the same variant as `target`, preserving every
    /// element value exactly. `None` when the conversion would lose
    /// information or cross families.
    pub(crate) fn coerced_into_kind_of(&self, target: &Value) -> Option<Value> {
        match target {
            Value::Empty => Some(Value::Empty),
            Value::Bit(_) => match self {
                Value::Bit(bits) => Some(Value::Bit(bits.clone())),
                _ => None,
            },
            Value::String(_) => match self {
                Value::String(text) => Some(Value::String(text.clone())),
                _ => None,
            },
            Value::Unstructured(_) => match self {
                Value::Unstructured(bytes) => Some(Value::Unstructured(bytes.clone())),
                _ => None,
            },
            Value::Integer8(_) => self.build_int(|v| i8::try_from(v).ok(), Value::Integer8),
            Value::Integer16(_) => self.build_int(|v| i16::try_from(v).ok(), Value::Integer16),
            Value::Integer32(_) => self.build_int(|v| i32::try_from(v).ok(), Value::Integer32),
            Value::Integer64(_) => self.build_int(|v| i64::try_from(v).ok(), Value::Integer64),
            Value::Natural8(_) => self.build_int(|v| u8::try_from(v).ok(), Value::Natural8),
            Value::Natural16(_) => self.build_int(|v| u16::try_from(v).ok(), Value::Natural16),
            Value::Natural32(_) => self.build_int(|v| u32::try_from(v).ok(), Value::Natural32),
            Value::Natural64(_) => self.build_int(|v| u64::try_from(v).ok(), Value::Natural64),
            Value::Real32(_) => {
                let wide = self.wide_numbers()?;
                let mut out = Vec::with_capacity(wide.len());
                for number in wide {
                    out.push(number.to_f32_exact()?);
                }
                Some(Value::Real32(out))
            }
            Value::Real64(_) => {
                let wide = self.wide_numbers()?;
                let mut out = Vec::with_capacity(wide.len());
                for number in wide {
                    out.push(number.to_f64_exact()?);
                }
                Some(Value::Real64(out))
            }
        }
    }

    fn build_int<T>(
        &self,
        narrow: impl Fn(i128) -> Option<T>,
        wrap: impl Fn(Vec<T>) -> Value,
    ) -> Option<Value> {
        let wide = self.wide_numbers()?;
        let mut out = Vec::with_capacity(wide.len());
        for number in wide {
            out.push(narrow(number.to_int_exact()?)?);
        }
        Some(wrap(out))
    }

    fn wide_numbers(&self) -> Option<Vec<WideNum>> {
        let collect_int = |iter: &mut dyn Iterator<Item = i128>| {
            iter.map(WideNum::Int).collect::<Vec<_>>()
        };
        match self {
            Value::Integer8(v) => Some(collect_int(&mut v.iter().map(|&x| i128::from(x)))),
            Value::Integer16(v) => Some(collect_int(&mut v.iter().map(|&x| i128::from(x)))),
            Value::Integer32(v) => Some(collect_int(&mut v.iter().map(|&x| i128::from(x)))),
            Value::Integer64(v) => Some(collect_int(&mut v.iter().map(|&x| i128::from(x)))),
            Value::Natural8(v) => Some(collect_int(&mut v.iter().map(|&x| i128::from(x)))),
            Value::Natural16(v) => Some(collect_int(&mut v.iter().map(|&x| i128::from(x)))),
            Value::Natural32(v) => Some(collect_int(&mut v.iter().map(|&x| i128::from(x)))),
            Value::Natural64(v) => Some(collect_int(&mut v.iter().map(|&x| i128::from(x)))),
            Value::Real32(v) => Some(v.iter().map(|&x| WideNum::Float(f64::from(x))).collect()),
            Value::Real64(v) => Some(v.iter().map(|&x| WideNum::Float(x)).collect()),
            _ => None,
        }
    }
}

impl WideNum {
    fn to_int_exact(self) -> Option<i128> {
        match self {
            WideNum::Int(value) => Some(value),
            WideNum::Float(value) => {
                // `i128::MAX as f64` rounds up to 2**127, which is itself
                // out of range; the strict bound excludes it.
                const LIMIT: f64 = i128::MAX as f64;
                if !value.is_finite() || value < -LIMIT || value >= LIMIT {
                    return None;
                }
                let truncated = value as i128;
                if truncated as f64 == value {
                    Some(truncated)
                } else {
                    None
                }
            }
        }
    }

    fn to_f64_exact(self) -> Option<f64> {
        match self {
            WideNum::Float(value) => Some(value),
            WideNum::Int(value) => {
                let converted = value as f64;
                if converted.is_finite() && converted as i128 == value {
                    Some(converted)
                } else {
                    None
                }
            }
        }
    }

    fn to_f32_exact(self) -> Option<f32> {
        match self {
            WideNum::Float(value) => {
                let converted = value as f32;
                if f64::from(converted) == value || (value.is_nan() && converted.is_nan()) {
                    Some(converted)
                } else {
                    None
                }
            }
            WideNum::Int(value) => {
                let converted = value as f32;
                if converted.is_finite() && converted as i128 == value {
                    Some(converted)
                } else {
                    None
                }
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bit(vec![value])
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(String::from(value))
    }
}

macro_rules! impl_scalar_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(vec![value])
                }
            }
        )*
    };
}

impl_scalar_from! {
    i8 => Integer8,
    i16 => Integer16,
    i32 => Integer32,
    i64 => Integer64,
    u8 => Natural8,
    u16 => Natural16,
    u32 => Natural32,
    u64 => Natural64,
    f32 => Real32,
    f64 => Real64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coerce(value: Value, target: &Value) -> Option<Value> {
        value.coerced_into_kind_of(target)
    }

    #[test]
    fn test_widening_integer() {
        assert_eq!(
            coerce(Value::from(42u8), &Value::from(0i64)),
            Some(Value::Integer64(vec![42]))
        );
    }

    #[test]
    fn test_narrowing_integer_preserves_value() {
        assert_eq!(
            coerce(Value::from(42i32), &Value::from(0u16)),
            Some(Value::Natural16(vec![42]))
        );
        assert_eq!(coerce(Value::from(70_000i32), &Value::from(0u16)), None);
        assert_eq!(coerce(Value::from(-1i32), &Value::from(0u16)), None);
    }

    #[test]
    fn test_float_to_integer() {
        assert_eq!(
            coerce(Value::from(42.0f64), &Value::from(0u8)),
            Some(Value::Natural8(vec![42]))
        );
        assert_eq!(coerce(Value::from(42.5f64), &Value::from(0u8)), None);
    }

    #[test]
    fn test_integer_to_float() {
        assert_eq!(
            coerce(Value::from(1u64 << 24), &Value::from(0f32)),
            Some(Value::Real32(vec![16_777_216.0]))
        );
        // 2**24 + 1 is not representable in f32.
        assert_eq!(coerce(Value::from((1u64 << 24) + 1), &Value::from(0f32)), None);
    }

    #[test]
    fn test_f64_to_f32_round_trip_required() {
        assert_eq!(
            coerce(Value::from(0.5f64), &Value::from(0f32)),
            Some(Value::Real32(vec![0.5]))
        );
        assert_eq!(coerce(Value::from(0.1f64), &Value::from(0f32)), None);
    }

    #[test]
    fn test_cross_family_rejected() {
        assert_eq!(coerce(Value::from("hi"), &Value::from(0u8)), None);
        assert_eq!(coerce(Value::from(1u8), &Value::from("")), None);
        assert_eq!(coerce(Value::from(true), &Value::from(0u8)), None);
        assert_eq!(
            coerce(Value::Unstructured(vec![1]), &Value::Bit(vec![false])),
            None
        );
    }

    #[test]
    fn test_vector_coercion() {
        assert_eq!(
            coerce(
                Value::Integer32(vec![1, 2, 3]),
                &Value::Natural8(Vec::new())
            ),
            Some(Value::Natural8(vec![1, 2, 3]))
        );
        assert_eq!(
            coerce(
                Value::Integer32(vec![1, 300, 3]),
                &Value::Natural8(Vec::new())
            ),
            None
        );
    }

    #[test]
    fn test_empty_target_absorbs() {
        assert_eq!(coerce(Value::from(5u8), &Value::Empty), Some(Value::Empty));
    }
}
