use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default deadline for a single oracle call.
pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Run mode, selecting how much the run may spend on the oracle and on learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// No learning; every job runs sequentially against the current rules.
    Standard,
    /// Learn from cold groups; cold jobs run one at a time.
    #[default]
    Smart,
    /// Learn from cold groups; groups run concurrently, teacher before students.
    Pro,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Standard => "standard",
            Mode::Smart => "smart",
            Mode::Pro => "pro",
        }
    }

    /// Whether jobs running under this mode may spawn a background learner.
    pub fn permits_learning(&self) -> bool {
        !matches!(self, Mode::Standard)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(Mode::Standard),
            "smart" => Ok(Mode::Smart),
            "pro" => Ok(Mode::Pro),
            _ => Err(format!("Unknown mode: {}", s)),
        }
    }
}

/// Configuration for one scheduler run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: Mode,
    /// Deadline applied to every field-inference call.
    pub oracle_timeout: Duration,
    /// Deadline applied to every pattern-synthesis call.
    pub learning_timeout: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            oracle_timeout: DEFAULT_ORACLE_TIMEOUT,
            learning_timeout: DEFAULT_ORACLE_TIMEOUT,
        }
    }
}

impl RunConfig {
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = timeout;
        self
    }

    pub fn with_learning_timeout(mut self, timeout: Duration) -> Self {
        self.learning_timeout = timeout;
        self
    }
}
