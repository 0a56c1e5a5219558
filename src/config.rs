//! Allocation policy.

use std::{fmt, str::FromStr};

use log::warn;

/// Environment variable read by [`Config::from_env`].
pub const FALLBACK_ENV: &str = "HUGEALLOC_FALLBACK";

/// What to do when the kernel can't give us huge pages, either because
/// the pool is exhausted or because the host never reserved any.
///
/// The same policy applies on every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fallback {
    /// Use ordinary heap memory instead. The region header records 0 so
    /// release knows it has to go back to the heap.
    #[default]
    Heap,
    /// Report the failure: a null pointer or an [`crate::Error::HugePages`].
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFallbackError(String);

impl fmt::Display for ParseFallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown fallback policy `{}` (expected `heap` or `fail`)", self.0)
    }
}

impl std::error::Error for ParseFallbackError {}

impl FromStr for Fallback {
    type Err = ParseFallbackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "heap" => Ok(Fallback::Heap),
            "fail" => Ok(Fallback::Fail),
            _ => Err(ParseFallbackError(s.to_string())),
        }
    }
}

impl fmt::Display for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fallback::Heap => write!(f, "heap"),
            Fallback::Fail => write!(f, "fail"),
        }
    }
}

/// Configuration shared by [`crate::acquire_with`] and [`crate::HugeAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Config {
    pub fallback: Fallback,
}

impl Config {
    pub const fn new() -> Self {
        Self { fallback: Fallback::Heap }
    }

    pub const fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Reads the policy from `HUGEALLOC_FALLBACK`. Missing or invalid values
    /// keep the default.
    pub fn from_env() -> Self {
        match std::env::var(FALLBACK_ENV) {
            Ok(value) => Self::from_env_value(&value),
            Err(_) => Self::default(),
        }
    }

    fn from_env_value(value: &str) -> Self {
        match value.parse() {
            Ok(fallback) => Self::default().with_fallback(fallback),
            Err(e) => {
                warn!("{FALLBACK_ENV}: {e}, using default policy");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_falls_back_to_heap() {
        assert_eq!(Fallback::Heap, Config::default().fallback);
        assert_eq!(Config::new(), Config::default());
    }

    #[test]
    fn parse_policies() {
        assert_eq!(Ok(Fallback::Heap), "heap".parse());
        assert_eq!(Ok(Fallback::Fail), " FAIL ".parse());
        assert!("mmap".parse::<Fallback>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for policy in [Fallback::Heap, Fallback::Fail] {
            assert_eq!(Ok(policy), policy.to_string().parse());
        }
    }

    #[test]
    fn invalid_env_value_keeps_default() {
        assert_eq!(Config::default(), Config::from_env_value("sometimes"));
        assert_eq!(Fallback::Fail, Config::from_env_value("fail").fallback);
    }
}
