use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A non-negative duration written in Go's `time.Duration` string format, e.g.
/// `10s`, `250ms` or `1h30m`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PolicyDuration(Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("durations must not be negative")]
    Negative,

    #[error("duration is too large")]
    Overflow,

    #[error("invalid number: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

// === impl PolicyDuration ===

impl PolicyDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for PolicyDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<PolicyDuration> for Duration {
    fn from(PolicyDuration(duration): PolicyDuration) -> Self {
        duration
    }
}

impl fmt::Display for PolicyDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl FromStr for PolicyDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn unit(unit: &str) -> Result<Duration, ParseError> {
            const MINUTE: Duration = Duration::from_secs(60);
            match unit {
                "ns" => Ok(Duration::from_nanos(1)),
                // Both the micro sign and the Greek letter mu.
                "us" | "\u{00b5}s" | "\u{03bc}s" => Ok(Duration::from_micros(1)),
                "ms" => Ok(Duration::from_millis(1)),
                "s" => Ok(Duration::from_secs(1)),
                "m" => Ok(MINUTE),
                "h" => Ok(MINUTE * 60),
                _ => Err(ParseError::InvalidUnit),
            }
        }

        let s = s.trim();
        let (negative, mut rest) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        if rest == "0" {
            return Ok(Self::default());
        }
        if rest.is_empty() {
            return Err(ParseError::NoUnit);
        }

        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| c.is_alphabetic())
                .ok_or(ParseError::NoUnit)?;
            let (value, tail) = rest.split_at(unit_start);
            // Only the leading component may carry a sign.
            if value.starts_with(['-', '+']) {
                return Err(ParseError::Negative);
            }
            let value = value.parse::<f64>()?;
            if !value.is_finite() || value < 0.0 {
                return Err(ParseError::Negative);
            }
            let unit_end = tail
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(tail.len());
            let (u, tail) = tail.split_at(unit_end);
            let component = Duration::try_from_secs_f64(unit(u)?.as_secs_f64() * value)
                .map_err(|_| ParseError::Overflow)?;
            total = total
                .checked_add(component)
                .ok_or(ParseError::Overflow)?;
            rest = tail;
        }

        if negative && !total.is_zero() {
            return Err(ParseError::Negative);
        }
        Ok(Self(total))
    }
}

impl Serialize for PolicyDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PolicyDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MINUTE: Duration = Duration::from_secs(60);

    #[rstest]
    #[case("0", Duration::ZERO)]
    #[case("+0", Duration::ZERO)]
    #[case("-0", Duration::ZERO)]
    #[case("-0s", Duration::ZERO)]
    #[case("5s", Duration::from_secs(5))]
    #[case("+5s", Duration::from_secs(5))]
    #[case("5.6s", Duration::from_millis(5600))]
    #[case(".5s", Duration::from_millis(500))]
    #[case("250ms", Duration::from_millis(250))]
    #[case("11us", Duration::from_micros(11))]
    #[case("12\u{00b5}s", Duration::from_micros(12))]
    #[case("10ns", Duration::from_nanos(10))]
    #[case("15m", 15 * MINUTE)]
    #[case("3h30m", 210 * MINUTE)]
    #[case("10.5s4m", 4 * MINUTE + Duration::from_millis(10_500))]
    fn parses_go_durations(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(input.parse::<PolicyDuration>(), Ok(expected.into()));
    }

    #[rstest]
    #[case("", ParseError::NoUnit)]
    #[case("10", ParseError::NoUnit)]
    #[case("10d", ParseError::InvalidUnit)]
    #[case("-5s", ParseError::Negative)]
    #[case("5s-3s", ParseError::Negative)]
    #[case("99999999999999999999h", ParseError::Overflow)]
    #[case("3000000000000000h3000000000000000h", ParseError::Overflow)]
    fn rejects_invalid_durations(#[case] input: &str, #[case] expected: ParseError) {
        assert_eq!(input.parse::<PolicyDuration>(), Err(expected));
    }

    #[test]
    fn deserializes_from_strings() {
        let d: PolicyDuration = serde_json::from_value(serde_json::json!("1m")).unwrap();
        assert_eq!(d.as_duration(), MINUTE);
        assert!(serde_json::from_value::<PolicyDuration>(serde_json::json!("soon")).is_err());
    }
}
