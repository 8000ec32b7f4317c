use std::{fmt, str::FromStr, time::Duration};

/// A non-negative duration in Go's `time.ParseDuration` format, as used by
/// the controller's environment variables and the `metricsExport` interval
/// (`"300ms"`, `"30s"`, `"10m"`, `"1h30m"`, ...).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct K8sDuration(Duration);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("expected a unit: one of 'ns', 'us', 'ms', 's', 'm', or 'h'")]
    NoUnit,

    #[error("invalid unit {0:?}: expected one of 'ns', 'us', 'ms', 's', 'm', or 'h'")]
    InvalidUnit(String),

    #[error("invalid number: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),

    #[error("durations must not be negative")]
    Negative,
}

impl K8sDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for K8sDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<K8sDuration> for Duration {
    fn from(K8sDuration(duration): K8sDuration) -> Self {
        duration
    }
}

impl FromStr for K8sDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        let mut s = s.trim_start_matches('+');

        // Go's grammar is a sequence of <decimal><unit> terms; a bare "0" is
        // the only unitless form.
        if s == "0" {
            return Ok(Self(Duration::ZERO));
        }

        let mut total = Duration::ZERO;
        while !s.is_empty() {
            let unit_start = s
                .find(|c: char| c.is_alphabetic())
                .ok_or(ParseError::NoUnit)?;
            let (value, rest) = s.split_at(unit_start);
            let value = value.parse::<f64>()?;

            let unit_end = rest
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(rest.len());
            let (unit, rest) = rest.split_at(unit_end);

            let base = match unit {
                "ns" => Duration::from_nanos(1),
                "us" | "\u{00b5}s" | "\u{03bc}s" => Duration::from_micros(1),
                "ms" => Duration::from_millis(1),
                "s" => Duration::from_secs(1),
                "m" => Duration::from_secs(60),
                "h" => Duration::from_secs(60 * 60),
                unit => return Err(ParseError::InvalidUnit(unit.to_string())),
            };
            total += base.mul_f64(value);
            s = rest;
        }

        Ok(Self(total))
    }
}

impl fmt::Display for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}
