//! Parsing of Kubernetes capacity quantity strings (`10Gi`, `500M`, `12e6`,
//! ...) into integer byte counts.
//!
//! Fractional values are resolved with an explicit rounding mode: half-even
//! by default, floor when parsing minimum capacities, and ceiling when
//! parsing maximum capacities.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuantityError {
    #[error("invalid quantity {0:?}")]
    Invalid(String),
    #[error("quantity {0:?} is out of the supported range")]
    OutOfRange(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rounding {
    Floor,
    Ceiling,
    HalfEven,
}

/// Parse a quantity string and round it to integer bytes.
pub fn parse_quantity(input: &str, rounding: Rounding) -> Result<i64, QuantityError> {
    let text = input.trim();
    let invalid = || QuantityError::Invalid(input.to_owned());
    let out_of_range = || QuantityError::OutOfRange(input.to_owned());

    let bytes = text.as_bytes();
    let mut index = 0;

    let mut mantissa: i128 = 0;
    let mut integer_digits = 0;
    while index < bytes.len() && bytes[index].is_ascii_digit() {
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add((bytes[index] - b'0') as i128))
            .ok_or_else(out_of_range)?;
        index += 1;
        integer_digits += 1;
    }
    if integer_digits == 0 {
        return Err(invalid());
    }

    let mut fraction_digits: u32 = 0;
    if index < bytes.len() && bytes[index] == b'.' {
        index += 1;
        while index < bytes.len() && bytes[index].is_ascii_digit() {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add((bytes[index] - b'0') as i128))
                .ok_or_else(out_of_range)?;
            index += 1;
            fraction_digits += 1;
        }
        if fraction_digits == 0 {
            return Err(invalid());
        }
    }

    let (multiplier, divisor_exponent): (i128, u32) = match &text[index..] {
        "" => (1, 0),
        "Ki" => (1 << 10, 0),
        "Mi" => (1 << 20, 0),
        "Gi" => (1 << 30, 0),
        "Ti" => (1 << 40, 0),
        "Pi" => (1 << 50, 0),
        "Ei" => (1 << 60, 0),
        "k" => (10i128.pow(3), 0),
        "M" => (10i128.pow(6), 0),
        "G" => (10i128.pow(9), 0),
        "T" => (10i128.pow(12), 0),
        "P" => (10i128.pow(15), 0),
        "E" => (10i128.pow(18), 0),
        suffix if suffix.starts_with('e') || suffix.starts_with('E') => {
            let exponent: i32 = suffix[1..].parse().map_err(|_| invalid())?;
            if exponent.unsigned_abs() > 30 {
                return Err(out_of_range());
            }
            if exponent >= 0 {
                (10i128.pow(exponent as u32), 0)
            } else {
                (1, exponent.unsigned_abs())
            }
        }
        _ => return Err(invalid()),
    };

    let numerator = mantissa.checked_mul(multiplier).ok_or_else(out_of_range)?;
    let denominator = 10i128
        .checked_pow(fraction_digits + divisor_exponent)
        .ok_or_else(out_of_range)?;

    let result = divide_rounding(numerator, denominator, rounding);
    i64::try_from(result).map_err(|_| out_of_range())
}

fn divide_rounding(numerator: i128, denominator: i128, rounding: Rounding) -> i128 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder == 0 {
        return quotient;
    }
    match rounding {
        Rounding::Floor => quotient,
        Rounding::Ceiling => quotient + 1,
        Rounding::HalfEven => {
            let twice = remainder * 2;
            if twice > denominator || (twice == denominator && quotient % 2 != 0) {
                quotient + 1
            } else {
                quotient
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(input: &str) -> i64 {
        parse_quantity(input, Rounding::HalfEven).unwrap()
    }

    #[test]
    fn plain_integers() {
        assert_eq!(parse("0"), 0);
        assert_eq!(parse("12345"), 12345);
    }

    #[test]
    fn binary_suffixes() {
        assert_eq!(parse("1Ki"), 1024);
        assert_eq!(parse("1Mi"), 1 << 20);
        assert_eq!(parse("10Gi"), 10_737_418_240);
        assert_eq!(parse("1Ti"), 1 << 40);
        assert_eq!(parse("1Pi"), 1 << 50);
        assert_eq!(parse("1Ei"), 1 << 60);
    }

    #[test]
    fn decimal_suffixes() {
        assert_eq!(parse("1k"), 1000);
        assert_eq!(parse("500M"), 500_000_000);
        assert_eq!(parse("1G"), 1_000_000_000);
        assert_eq!(parse("2T"), 2_000_000_000_000);
        assert_eq!(parse("1P"), 10i64.pow(15));
        assert_eq!(parse("1E"), 10i64.pow(18));
    }

    #[test]
    fn decimal_exponents() {
        assert_eq!(parse("12e6"), 12_000_000);
        assert_eq!(parse("12E6"), 12_000_000);
        assert_eq!(parse("5e0"), 5);
        assert_eq!(parse("1500e-3"), 2); // 1.5 rounds half-even to 2
    }

    #[test]
    fn fractional_values() {
        assert_eq!(parse("1.5Gi"), 1_610_612_736);
        assert_eq!(parse("0.5Ki"), 512);
        assert_eq!(parse("2.5"), 2); // ties round to even
        assert_eq!(parse("1.5"), 2);
        assert_eq!(parse("3.5"), 4);
    }

    #[test]
    fn explicit_rounding_modes() {
        assert_eq!(parse_quantity("1.9", Rounding::Floor).unwrap(), 1);
        assert_eq!(parse_quantity("1.1", Rounding::Ceiling).unwrap(), 2);
        assert_eq!(parse_quantity("0.001Ki", Rounding::Floor).unwrap(), 1);
        assert_eq!(parse_quantity("0.0001Ki", Rounding::Floor).unwrap(), 0);
        assert_eq!(parse_quantity("0.0001Ki", Rounding::Ceiling).unwrap(), 1);
    }

    #[test]
    fn surrounding_whitespace_is_tolerated() {
        assert_eq!(parse("10Gi\n"), 10_737_418_240);
    }

    #[test]
    fn invalid_quantities_are_rejected() {
        for input in ["", "abc", "1X", "-5", "1.", ".5", "1e", "1ee3", "1 Gi"] {
            assert!(
                matches!(
                    parse_quantity(input, Rounding::HalfEven),
                    Err(QuantityError::Invalid(_))
                ),
                "expected {:?} to be invalid",
                input
            );
        }
    }

    #[test]
    fn out_of_range_quantities_are_rejected() {
        assert!(matches!(
            parse_quantity("10E", Rounding::HalfEven),
            Err(QuantityError::OutOfRange(_))
        ));
        assert!(matches!(
            parse_quantity("1e31", Rounding::HalfEven),
            Err(QuantityError::OutOfRange(_))
        ));
    }
}
