//! Size literals such as `500k` or `2M`: decimal (SI) units, conversions saturate.

use std::str::FromStr;

/// Size unit, scale 1000 between neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeUnit {
    Single,
    Kilo,
    Mega,
    Giga,
    Tera,
    Peta,
}

impl SizeUnit {
    fn exponent(self) -> u32 {
        match self {
            SizeUnit::Single => 0,
            SizeUnit::Kilo => 1,
            SizeUnit::Mega => 2,
            SizeUnit::Giga => 3,
            SizeUnit::Tera => 4,
            SizeUnit::Peta => 5,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            SizeUnit::Single => "",
            SizeUnit::Kilo => "k",
            SizeUnit::Mega => "m",
            SizeUnit::Giga => "g",
            SizeUnit::Tera => "t",
            SizeUnit::Peta => "p",
        }
    }

    fn from_suffix(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'k' => Some(SizeUnit::Kilo),
            'm' => Some(SizeUnit::Mega),
            'g' => Some(SizeUnit::Giga),
            't' => Some(SizeUnit::Tera),
            'p' => Some(SizeUnit::Peta),
            _ => None,
        }
    }

    /// Convert `size` expressed in `self` into `target`. Scaling up saturates at
    /// `i64::MIN` / `i64::MAX`; scaling down truncates toward zero.
    pub fn convert(self, size: i64, target: SizeUnit) -> i64 {
        let from = self.exponent();
        let to = target.exponent();
        if from >= to {
            size.saturating_mul(1000i64.pow(from - to))
        } else {
            size / 1000i64.pow(to - from)
        }
    }

    pub fn to_singles(self, size: i64) -> i64 {
        self.convert(size, SizeUnit::Single)
    }
}

/// A size with its unit, e.g. `500k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeValue {
    size: i64,
    unit: SizeUnit,
}

impl SizeValue {
    pub fn new(size: i64, unit: SizeUnit) -> Self {
        Self { size, unit }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn unit(&self) -> SizeUnit {
        self.unit
    }

    /// Value in base units.
    pub fn singles(&self) -> i64 {
        self.unit.to_singles(self.size)
    }

    pub fn to(&self, unit: SizeUnit) -> i64 {
        self.unit.convert(self.size, unit)
    }
}

impl FromStr for SizeValue {
    type Err = SizeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        let last = t
            .chars()
            .last()
            .ok_or_else(|| SizeParseError(s.to_string()))?;
        let (digits, unit) = match SizeUnit::from_suffix(last) {
            Some(unit) => (&t[..t.len() - last.len_utf8()], unit),
            None => (t, SizeUnit::Single),
        };
        let size = digits
            .trim()
            .parse::<i64>()
            .map_err(|_| SizeParseError(s.to_string()))?;
        Ok(SizeValue { size, unit })
    }
}

impl std::fmt::Display for SizeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.size, self.unit.suffix())
    }
}

/// Size literal is not `<int>[k|m|g|t|p]`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot parse size value '{0}'")]
pub struct SizeParseError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units_case_insensitive() {
        assert_eq!("500k".parse::<SizeValue>().unwrap().singles(), 500_000);
        assert_eq!("2M".parse::<SizeValue>().unwrap().singles(), 2_000_000);
        assert_eq!("3g".parse::<SizeValue>().unwrap().singles(), 3_000_000_000);
        assert_eq!("1T".parse::<SizeValue>().unwrap().to(SizeUnit::Giga), 1000);
        assert_eq!("7p".parse::<SizeValue>().unwrap().to(SizeUnit::Tera), 7000);
        assert_eq!("1024".parse::<SizeValue>().unwrap().singles(), 1024);
    }

    #[test]
    fn parse_then_convert_to_same_unit_is_identity() {
        for (lit, unit, n) in [
            ("12", SizeUnit::Single, 12),
            ("12k", SizeUnit::Kilo, 12),
            ("12m", SizeUnit::Mega, 12),
            ("12g", SizeUnit::Giga, 12),
            ("12t", SizeUnit::Tera, 12),
            ("12p", SizeUnit::Peta, 12),
        ] {
            assert_eq!(lit.parse::<SizeValue>().unwrap().to(unit), n, "{}", lit);
        }
    }

    #[test]
    fn scaling_down_truncates() {
        let v = SizeValue::new(1999, SizeUnit::Single);
        assert_eq!(v.to(SizeUnit::Kilo), 1);
        assert_eq!(SizeUnit::Kilo.convert(999_999, SizeUnit::Mega), 999);
    }

    #[test]
    fn overflow_saturates() {
        let big = SizeValue::new(i64::MAX / 10, SizeUnit::Peta);
        assert_eq!(big.singles(), i64::MAX);
        let small = SizeValue::new(i64::MIN / 10, SizeUnit::Tera);
        assert_eq!(small.singles(), i64::MIN);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<SizeValue>().is_err());
        assert!("k".parse::<SizeValue>().is_err());
        assert!("12x".parse::<SizeValue>().is_err());
        assert!("1.5k".parse::<SizeValue>().is_err());
    }

    #[test]
    fn display_keeps_unit() {
        assert_eq!("500K".parse::<SizeValue>().unwrap().to_string(), "500k");
    }
}
