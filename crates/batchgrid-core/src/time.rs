//! Wall-clock limits in scheduler notation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::ConfigError;

/// A wall-clock limit.
///
/// Accepts the notations schedulers print and expect: `SS`, `MM:SS`,
/// `HH:MM:SS`, `D-HH`, `D-HH:MM`, `D-HH:MM:SS`, plus `infinite`/`unlimited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunTime {
    Limited(u64),
    Unlimited,
}

impl RunTime {
    pub fn from_secs(secs: u64) -> Self {
        RunTime::Limited(secs)
    }

    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let text = input.trim();
        let invalid = || ConfigError::InvalidRunTime(input.to_string());
        if text.is_empty() {
            return Err(invalid());
        }
        if matches!(
            text.to_ascii_lowercase().as_str(),
            "infinite" | "unlimited"
        ) {
            return Ok(RunTime::Unlimited);
        }

        let (days, clock) = match text.split_once('-') {
            Some((d, rest)) => (d.parse::<u64>().map_err(|_| invalid())?, Some(rest)),
            None => (0, None),
        };

        let fields: Vec<u64> = clock
            .unwrap_or(text)
            .split(':')
            .map(|f| f.parse::<u64>())
            .collect::<Result<_, _>>()
            .map_err(|_| invalid())?;

        let secs = match (clock.is_some(), fields.as_slice()) {
            // With a day prefix the first field is always hours.
            (true, [h]) => h * 3600,
            (true, [h, m]) => h * 3600 + m * 60,
            (true, [h, m, s]) => h * 3600 + m * 60 + s,
            (false, [s]) => *s,
            (false, [m, s]) => m * 60 + s,
            (false, [h, m, s]) => h * 3600 + m * 60 + s,
            _ => return Err(invalid()),
        };
        Ok(RunTime::Limited(days * 86_400 + secs))
    }

    /// Seconds, or `None` when unlimited.
    pub fn as_secs(&self) -> Option<u64> {
        match self {
            RunTime::Limited(s) => Some(*s),
            RunTime::Unlimited => None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, RunTime::Unlimited)
    }
}

impl fmt::Display for RunTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunTime::Unlimited => f.write_str("infinite"),
            RunTime::Limited(total) => {
                let days = total / 86_400;
                let h = (total % 86_400) / 3600;
                let m = (total % 3600) / 60;
                let s = total % 60;
                if days > 0 {
                    write!(f, "{days}-{h:02}:{m:02}:{s:02}")
                } else {
                    write!(f, "{h:02}:{m:02}:{s:02}")
                }
            }
        }
    }
}

impl FromStr for RunTime {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunTime::parse(s)
    }
}

impl Serialize for RunTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RunTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RunTime::parse(&raw).map_err(serde::de::Error::custom)
    }
}
