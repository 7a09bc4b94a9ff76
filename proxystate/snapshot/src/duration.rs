use serde::{de, Deserialize, Deserializer};
use std::{fmt, str::FromStr, time::Duration};

/// A signed duration in the format accepted by Go's `time.ParseDuration`.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct GoDuration {
    duration: Duration,
    is_negative: bool,
}

/// A timeout that distinguishes "not configured" from "explicitly disabled".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    #[default]
    Unset,
    Value(Duration),
    Disabled,
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("invalid floating-point number: {}", .0)]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

// === impl GoDuration ===

impl From<Duration> for GoDuration {
    fn from(duration: Duration) -> Self {
        Self {
            duration,
            is_negative: false,
        }
    }
}

impl GoDuration {
    pub fn from_nanos(nanos: i64) -> Self {
        Self {
            duration: Duration::from_nanos(nanos.unsigned_abs()),
            is_negative: nanos < 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.is_negative && !self.duration.is_zero()
    }

    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.duration.is_zero()
    }

    /// The magnitude, or `None` for negative durations.
    pub fn as_unsigned(&self) -> Option<Duration> {
        if self.is_negative() {
            return None;
        }
        Some(self.duration)
    }
}

impl fmt::Debug for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::fmt::Write;
        if self.is_negative {
            f.write_char('-')?;
        }
        fmt::Debug::fmt(&self.duration, f)
    }
}

impl fmt::Display for GoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for GoDuration {
    type Err = ParseError;

    fn from_str(mut s: &str) -> Result<Self, Self::Err> {
        fn duration_from_units(val: f64, unit: &str) -> Result<Duration, ParseError> {
            const MINUTE: Duration = Duration::from_secs(60);
            let base = match unit {
                "ns" => Duration::from_nanos(1),
                // U+00B5 is the "micro sign" while U+03BC is "Greek letter mu"
                "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
                "ms" => Duration::from_millis(1),
                "s" => Duration::from_secs(1),
                "m" => MINUTE,
                "h" => MINUTE * 60,
                _ => return Err(ParseError::InvalidUnit),
            };
            Ok(base.mul_f64(val))
        }

        let is_negative = s.starts_with('-');
        s = s.trim_start_matches('+').trim_start_matches('-');

        let mut total = Duration::from_secs(0);
        while !s.is_empty() {
            if let Some(unit_start) = s.find(|c: char| c.is_alphabetic()) {
                let (val, rest) = s.split_at(unit_start);
                let val = val.parse::<f64>()?;
                let unit = if let Some(next_numeric_start) = rest.find(|c: char| !c.is_alphabetic())
                {
                    let (unit, rest) = rest.split_at(next_numeric_start);
                    s = rest;
                    unit
                } else {
                    s = "";
                    rest
                };
                total += duration_from_units(val, unit)?;
            } else if s == "0" {
                return Ok(GoDuration {
                    duration: Duration::from_secs(0),
                    is_negative,
                });
            } else {
                return Err(ParseError::NoUnit);
            }
        }

        Ok(GoDuration {
            duration: total,
            is_negative,
        })
    }
}

/// Accepts either a duration string or an integer number of nanoseconds.
impl<'de> Deserialize<'de> for GoDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = GoDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string or a number of nanoseconds")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                value.parse::<GoDuration>().map_err(de::Error::custom)
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(GoDuration::from_nanos(value))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(Duration::from_nanos(value).into())
            }
        }
        deserializer.deserialize_any(Visitor)
    }
}

// === impl Timeout ===

/// Zero is unset; a negative duration disables the timeout.
impl From<GoDuration> for Timeout {
    fn from(d: GoDuration) -> Self {
        if d.is_zero() {
            Self::Unset
        } else if d.is_negative() {
            Self::Disabled
        } else {
            Self::Value(d.duration)
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        GoDuration::from(d).into()
    }
}

impl Timeout {
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// The duration to configure on the data plane, where zero disables the
    /// timeout.
    pub fn to_data_plane(self) -> Option<Duration> {
        match self {
            Self::Unset => None,
            Self::Value(d) => Some(d),
            Self::Disabled => Some(Duration::ZERO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neg(duration: Duration) -> GoDuration {
        GoDuration {
            duration,
            is_negative: true,
        }
    }

    #[test]
    fn parses_the_same_as_go() {
        const MINUTE: Duration = Duration::from_secs(60);
        const HOUR: Duration = Duration::from_secs(60 * 60);
        let cases: &[(&str, GoDuration)] = &[
            ("0", Duration::ZERO.into()),
            ("5s", Duration::from_secs(5).into()),
            ("1478s", Duration::from_secs(1478).into()),
            ("-5s", neg(Duration::from_secs(5))),
            ("+5s", Duration::from_secs(5).into()),
            ("5.6s", (Duration::from_secs(5) + Duration::from_millis(600)).into()),
            (".5s", Duration::from_millis(500).into()),
            ("10ns", Duration::from_nanos(10).into()),
            ("11us", Duration::from_micros(11).into()),
            ("12\u{00b5}s", Duration::from_micros(12).into()),
            ("13ms", Duration::from_millis(13).into()),
            ("15m", (15 * MINUTE).into()),
            ("16h", (16 * HOUR).into()),
            ("3h30m", (3 * HOUR + 30 * MINUTE).into()),
            (
                "-2m3.4s",
                neg(2 * MINUTE + Duration::from_secs(3) + Duration::from_millis(400)),
            ),
            ("1h2m3s4ms5us6ns", (HOUR + 2 * MINUTE + Duration::from_secs(3) + Duration::from_millis(4) + Duration::from_micros(5) + Duration::from_nanos(6)).into()),
        ];

        for (input, expected) in cases {
            let parsed = input.parse::<GoDuration>().unwrap();
            assert_eq!(&parsed, expected, "{input}");
        }
    }

    #[test]
    fn rejects_what_go_rejects() {
        assert_eq!("3".parse::<GoDuration>(), Err(ParseError::NoUnit));
        assert_eq!("3x".parse::<GoDuration>(), Err(ParseError::InvalidUnit));
        assert!(matches!(
            "-.s".parse::<GoDuration>(),
            Err(ParseError::NotANumber(_))
        ));
    }

    #[test]
    fn deserializes_strings_and_nanos() {
        let d: GoDuration = serde_json::from_value(serde_json::json!("10s")).unwrap();
        assert_eq!(d, Duration::from_secs(10).into());
        let d: GoDuration = serde_json::from_value(serde_json::json!(1_000_000)).unwrap();
        assert_eq!(d, Duration::from_millis(1).into());
        let d: GoDuration = serde_json::from_value(serde_json::json!(-1)).unwrap();
        assert!(d.is_negative());
    }

    #[test]
    fn timeouts_are_tri_state() {
        assert_eq!(Timeout::from(GoDuration::default()), Timeout::Unset);
        assert_eq!(
            Timeout::from(GoDuration::from_nanos(-1)),
            Timeout::Disabled
        );
        assert_eq!(
            Timeout::from(Duration::from_secs(3)),
            Timeout::Value(Duration::from_secs(3))
        );
        assert_eq!(Timeout::Disabled.to_data_plane(), Some(Duration::ZERO));
        assert_eq!(Timeout::Unset.to_data_plane(), None);
    }
}
