//! Numeric model for expression evaluation.
//!
//! Plain numbers evaluate as `i64`/`f64`. As soon as a currency field takes
//! part in an operation the whole computation moves to [`Fixed`], a scaled
//! `i128`, so chained money arithmetic (totals, discount ratios, price
//! increases) does not pick up binary rounding drift.

use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;

/// Largest number of fractional digits kept after multiplication.
const MAX_SCALE: u32 = 18;
/// Fractional digits produced by division.
const DIV_SCALE: u32 = 12;

/// Exact decimal: `mantissa / 10^scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixed {
    mantissa: i128,
    scale: u32,
}

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

/// Integer division rounding half to even, the rounding MongoDB uses for `$round`.
fn div_round_half_even(n: i128, d: i128) -> i128 {
    let q = n / d;
    let r = n % d;
    if r == 0 {
        return q;
    }
    let rem = r.abs();
    let away = match rem.cmp(&(d.abs() - rem)) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => q % 2 != 0,
    };
    if !away {
        q
    } else if (n < 0) != (d < 0) {
        q - 1
    } else {
        q + 1
    }
}

impl Fixed {
    pub fn from_i64(value: i64) -> Self {
        Fixed {
            mantissa: value as i128,
            scale: 0,
        }
    }

    /// Converts through the shortest decimal representation of the double,
    /// so `0.1` becomes exactly one tenth.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        Self::parse(&value.to_string())
    }

    /// Parse a decimal literal such as `-12.50` or `1.5e3`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (body, exponent) = match text.find(|c: char| c == 'e' || c == 'E') {
            Some(i) => (&text[..i], text[i + 1..].parse::<i32>().ok()?),
            None => (text, 0),
        };
        let (negative, digits) = match body.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, body.strip_prefix('+').unwrap_or(body)),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }

        let mut mantissa: i128 = 0;
        for c in int_part.chars().chain(frac_part.chars()) {
            let digit = c.to_digit(10)? as i128;
            mantissa = mantissa.checked_mul(10)?.checked_add(digit)?;
        }
        if negative {
            mantissa = -mantissa;
        }

        let scale = frac_part.len() as i64 - exponent as i64;
        let fixed = if scale < 0 {
            Fixed {
                mantissa: mantissa.checked_mul(pow10(u32::try_from(-scale).ok()?)?)?,
                scale: 0,
            }
        } else {
            Fixed {
                mantissa,
                scale: u32::try_from(scale).ok()?,
            }
        };

        if fixed.scale > MAX_SCALE {
            fixed.rescale(MAX_SCALE).map(Fixed::normalized)
        } else {
            Some(fixed.normalized())
        }
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn is_zero(&self) -> bool {
        self.mantissa == 0
    }

    /// Drop trailing fractional zeros.
    fn normalized(mut self) -> Self {
        while self.scale > 0 && self.mantissa % 10 == 0 {
            self.mantissa /= 10;
            self.scale -= 1;
        }
        self
    }

    fn rescale(self, scale: u32) -> Option<Self> {
        match scale.cmp(&self.scale) {
            Ordering::Equal => Some(self),
            Ordering::Greater => Some(Fixed {
                mantissa: self.mantissa.checked_mul(pow10(scale - self.scale)?)?,
                scale,
            }),
            Ordering::Less => Some(Fixed {
                mantissa: div_round_half_even(self.mantissa, pow10(self.scale - scale)?),
                scale,
            }),
        }
    }

    fn aligned(self, other: Self) -> Option<(i128, i128, u32)> {
        let scale = self.scale.max(other.scale);
        Some((
            self.rescale(scale)?.mantissa,
            other.rescale(scale)?.mantissa,
            scale,
        ))
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        let (a, b, scale) = self.aligned(rhs)?;
        Some(Fixed { mantissa: a.checked_add(b)?, scale }.normalized())
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        let (a, b, scale) = self.aligned(rhs)?;
        Some(Fixed { mantissa: a.checked_sub(b)?, scale }.normalized())
    }

    pub fn checked_mul(self, rhs: Self) -> Option<Self> {
        let product = Fixed {
            mantissa: self.mantissa.checked_mul(rhs.mantissa)?,
            scale: self.scale + rhs.scale,
        };
        if product.scale > MAX_SCALE {
            product.rescale(MAX_SCALE).map(Fixed::normalized)
        } else {
            Some(product.normalized())
        }
    }

    /// Division rounded half-even to twelve fractional digits. `None` on a
    /// zero divisor or overflow.
    pub fn checked_div(self, rhs: Self) -> Option<Self> {
        if rhs.is_zero() {
            return None;
        }
        // (a / 10^sa) / (b / 10^sb) = a * 10^sb / (b * 10^sa)
        let numerator = self.mantissa.checked_mul(pow10(rhs.scale + DIV_SCALE)?)?;
        let denominator = rhs.mantissa.checked_mul(pow10(self.scale)?)?;
        Some(
            Fixed {
                mantissa: div_round_half_even(numerator, denominator),
                scale: DIV_SCALE,
            }
            .normalized(),
        )
    }

    /// Round half-even to `places` fractional digits; negative places round
    /// to tens, hundreds, and so on.
    pub fn round(self, places: i32) -> Option<Self> {
        if places >= 0 {
            let places = places as u32;
            if places >= self.scale {
                return Some(self);
            }
            return self.rescale(places).map(Fixed::normalized);
        }
        let shift = places.unsigned_abs();
        let divisor = pow10(self.scale + shift)?;
        let rounded = div_round_half_even(self.mantissa, divisor);
        Some(Fixed {
            mantissa: rounded.checked_mul(pow10(shift)?)?,
            scale: 0,
        })
    }

    pub fn abs(self) -> Self {
        Fixed {
            mantissa: self.mantissa.abs(),
            scale: self.scale,
        }
    }

    pub fn to_f64(self) -> f64 {
        self.to_string().parse().unwrap_or(f64::NAN)
    }

    pub fn to_i64(self) -> Option<i64> {
        if self.scale == 0 {
            i64::try_from(self.mantissa).ok()
        } else {
            None
        }
    }
}

impl PartialOrd for Fixed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fixed {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.aligned(*other) {
            Some((a, b, _)) => a.cmp(&b),
            None => self
                .to_f64()
                .partial_cmp(&other.to_f64())
                .unwrap_or(Ordering::Equal),
        }
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        if self.scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let scale = self.scale as usize;
        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{int_part}.{frac_part}")
    }
}

/// A number during evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
    Fixed(Fixed),
}

impl Num {
    /// Read a JSON number; `currency` selects the fixed-point representation.
    pub fn from_json(number: &Number, currency: bool) -> Num {
        if currency {
            let fixed = match number.as_i64() {
                Some(i) => Some(Fixed::from_i64(i)),
                None => number.as_f64().and_then(Fixed::from_f64),
            };
            if let Some(fixed) = fixed {
                return Num::Fixed(fixed);
            }
        }
        match number.as_i64() {
            Some(i) => Num::Int(i),
            None => Num::Float(number.as_f64().unwrap_or(f64::NAN)),
        }
    }

    pub fn from_value(value: &Value, currency: bool) -> Option<Num> {
        match value {
            Value::Number(n) => Some(Num::from_json(n, currency)),
            _ => None,
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            Num::Int(i) => Value::from(i),
            Num::Float(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
            Num::Fixed(fixed) => match fixed.to_i64() {
                Some(i) => Value::from(i),
                None => Number::from_f64(fixed.to_f64())
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            },
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
            Num::Fixed(fixed) => fixed.to_f64(),
        }
    }

    pub fn is_fixed(self) -> bool {
        matches!(self, Num::Fixed(_))
    }

    pub fn is_zero(self) -> bool {
        match self {
            Num::Int(i) => i == 0,
            Num::Float(f) => f == 0.0,
            Num::Fixed(fixed) => fixed.is_zero(),
        }
    }

    fn to_fixed(self) -> Result<Fixed, String> {
        match self {
            Num::Int(i) => Ok(Fixed::from_i64(i)),
            Num::Float(f) => Fixed::from_f64(f)
                .ok_or_else(|| format!("cannot represent {f} as a fixed-point amount")),
            Num::Fixed(fixed) => Ok(fixed),
        }
    }

    fn overflow() -> String {
        "numeric overflow in fixed-point arithmetic".to_string()
    }

    pub fn add(self, rhs: Num) -> Result<Num, String> {
        match (self, rhs) {
            (Num::Int(a), Num::Int(b)) => Ok(a
                .checked_add(b)
                .map(Num::Int)
                .unwrap_or(Num::Float(a as f64 + b as f64))),
            (a, b) if a.is_fixed() || b.is_fixed() => a
                .to_fixed()?
                .checked_add(b.to_fixed()?)
                .map(Num::Fixed)
                .ok_or_else(Num::overflow),
            (a, b) => Ok(Num::Float(a.as_f64() + b.as_f64())),
        }
    }

    pub fn sub(self, rhs: Num) -> Result<Num, String> {
        match (self, rhs) {
            (Num::Int(a), Num::Int(b)) => Ok(a
                .checked_sub(b)
                .map(Num::Int)
                .unwrap_or(Num::Float(a as f64 - b as f64))),
            (a, b) if a.is_fixed() || b.is_fixed() => a
                .to_fixed()?
                .checked_sub(b.to_fixed()?)
                .map(Num::Fixed)
                .ok_or_else(Num::overflow),
            (a, b) => Ok(Num::Float(a.as_f64() - b.as_f64())),
        }
    }

    pub fn mul(self, rhs: Num) -> Result<Num, String> {
        match (self, rhs) {
            (Num::Int(a), Num::Int(b)) => Ok(a
                .checked_mul(b)
                .map(Num::Int)
                .unwrap_or(Num::Float(a as f64 * b as f64))),
            (a, b) if a.is_fixed() || b.is_fixed() => a
                .to_fixed()?
                .checked_mul(b.to_fixed()?)
                .map(Num::Fixed)
                .ok_or_else(Num::overflow),
            (a, b) => Ok(Num::Float(a.as_f64() * b.as_f64())),
        }
    }

    pub fn div(self, rhs: Num) -> Result<Num, String> {
        if rhs.is_zero() {
            return Err("can't $divide by zero".to_string());
        }
        if self.is_fixed() || rhs.is_fixed() {
            return self
                .to_fixed()?
                .checked_div(rhs.to_fixed()?)
                .map(Num::Fixed)
                .ok_or_else(Num::overflow);
        }
        Ok(Num::Float(self.as_f64() / rhs.as_f64()))
    }

    pub fn round(self, places: i32) -> Result<Num, String> {
        match self {
            Num::Int(_) if places >= 0 => Ok(self),
            Num::Int(i) => Fixed::from_i64(i)
                .round(places)
                .and_then(Fixed::to_i64)
                .map(Num::Int)
                .ok_or_else(Num::overflow),
            Num::Float(f) => match Fixed::from_f64(f) {
                Some(fixed) => fixed
                    .round(places)
                    .map(|r| Num::Float(r.to_f64()))
                    .ok_or_else(Num::overflow),
                None => Ok(self),
            },
            Num::Fixed(fixed) => fixed.round(places).map(Num::Fixed).ok_or_else(Num::overflow),
        }
    }

    pub fn abs(self) -> Num {
        match self {
            Num::Int(i) => i.checked_abs().map(Num::Int).unwrap_or(Num::Float((i as f64).abs())),
            Num::Float(f) => Num::Float(f.abs()),
            Num::Fixed(fixed) => Num::Fixed(fixed.abs()),
        }
    }

    pub fn compare(self, rhs: Num) -> Ordering {
        match (self, rhs) {
            (Num::Int(a), Num::Int(b)) => a.cmp(&b),
            (a, b) if a.is_fixed() || b.is_fixed() => match (a.to_fixed(), b.to_fixed()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal),
            },
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Equal),
        }
    }
}
