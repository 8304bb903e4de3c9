//! Quota table configuration and lookup.
//!
//! Every `(LimitClass, Tier)` pair has exactly one quota row. The table is
//! validated once at startup and is immutable afterwards, so a lookup at
//! request time cannot fail.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FormguardError, Result};

/// Shortest window a quota row may use.
pub const MIN_WINDOW_MS: u64 = 1_000;

const MINUTE_MS: u64 = 60 * 1_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

/// The kind of traffic being throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitClass {
    /// Public form submissions, keyed by client IP
    Submission,
    /// Authenticated API calls, keyed by user id
    Api,
    /// Form creation, keyed by user id over a long window
    FormCreation,
}

impl LimitClass {
    /// All limit classes, in table order.
    pub const ALL: [LimitClass; 3] = [
        LimitClass::Submission,
        LimitClass::Api,
        LimitClass::FormCreation,
    ];

    /// Stable name used in counter keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitClass::Submission => "submission",
            LimitClass::Api => "api",
            LimitClass::FormCreation => "form_creation",
        }
    }

    fn index(self) -> usize {
        match self {
            LimitClass::Submission => 0,
            LimitClass::Api => 1,
            LimitClass::FormCreation => 2,
        }
    }
}

impl fmt::Display for LimitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription tier of a tenant.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    #[default]
    Free,
    Starter,
    Pro,
    Enterprise,
}

impl Tier {
    /// All tiers, in table order.
    pub const ALL: [Tier; 4] = [Tier::Free, Tier::Starter, Tier::Pro, Tier::Enterprise];

    /// Stable name used in counter keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Starter => "starter",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Parse a plan name coming from billing state.
    ///
    /// The value is untrusted: anything missing or unrecognised is `Free`.
    pub fn parse_or_free(raw: Option<&str>) -> Tier {
        raw.and_then(|s| s.parse().ok()).unwrap_or_default()
    }

    fn index(self) -> usize {
        match self {
            Tier::Free => 0,
            Tier::Starter => 1,
            Tier::Pro => 2,
            Tier::Enterprise => 3,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a plan name is not a known tier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier: {0}")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "starter" => Ok(Tier::Starter),
            "pro" => Ok(Tier::Pro),
            "enterprise" => Ok(Tier::Enterprise),
            _ => Err(UnknownTier(s.to_string())),
        }
    }
}

/// A fixed-window quota: at most `limit` requests per `window_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRow {
    /// Maximum requests allowed in one window
    pub limit: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl QuotaRow {
    /// Create a validated quota row.
    pub fn new(limit: u64, window_ms: u64) -> Result<Self> {
        let row = Self { limit, window_ms };
        row.validate()?;
        Ok(row)
    }

    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.limit < 1 {
            return Err(FormguardError::Config(format!(
                "quota limit must be at least 1, got {}",
                self.limit
            )));
        }
        if self.window_ms < MIN_WINDOW_MS {
            return Err(FormguardError::Config(format!(
                "quota window must be at least {}ms, got {}ms",
                MIN_WINDOW_MS, self.window_ms
            )));
        }
        Ok(())
    }
}

const fn row(limit: u64, window_ms: u64) -> QuotaRow {
    QuotaRow { limit, window_ms }
}

const DEFAULT_ROWS: [[QuotaRow; 4]; 3] = [
    // submission: free, starter, pro, enterprise
    [
        row(10, MINUTE_MS),
        row(30, MINUTE_MS),
        row(100, MINUTE_MS),
        row(500, MINUTE_MS),
    ],
    // api
    [
        row(100, HOUR_MS),
        row(500, HOUR_MS),
        row(1_000, HOUR_MS),
        row(10_000, HOUR_MS),
    ],
    // form_creation
    [
        row(5, DAY_MS),
        row(20, DAY_MS),
        row(100, DAY_MS),
        row(1_000, DAY_MS),
    ],
];

/// Quota rows as they appear in configuration: class -> tier -> row.
pub type QuotaOverrides = HashMap<LimitClass, HashMap<Tier, QuotaRow>>;

/// Total mapping from `(LimitClass, Tier)` to a quota row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaTable {
    rows: [[QuotaRow; 4]; 3],
}

impl Default for QuotaTable {
    fn default() -> Self {
        Self { rows: DEFAULT_ROWS }
    }
}

impl QuotaTable {
    /// Look up the quota for a class and tier.
    pub fn lookup(&self, class: LimitClass, tier: Tier) -> QuotaRow {
        self.rows[class.index()][tier.index()]
    }

    /// Build a table from configured rows.
    ///
    /// The rows must cover every class and tier; a missing or invalid row
    /// is a configuration error.
    pub fn from_overrides(overrides: &QuotaOverrides) -> Result<Self> {
        let mut rows = DEFAULT_ROWS;

        for class in LimitClass::ALL {
            for tier in Tier::ALL {
                let configured = overrides
                    .get(&class)
                    .and_then(|tiers| tiers.get(&tier))
                    .ok_or_else(|| {
                        FormguardError::Config(format!("missing quota row for {}/{}", class, tier))
                    })?;

                configured.validate().map_err(|e| {
                    FormguardError::Config(format!("invalid quota row for {}/{}: {}", class, tier, e))
                })?;

                rows[class.index()][tier.index()] = *configured;
            }
        }

        Ok(Self { rows })
    }

    /// Use configured rows when present, the built-in table otherwise.
    pub fn from_config(overrides: Option<&QuotaOverrides>) -> Result<Self> {
        match overrides {
            Some(overrides) => Self::from_overrides(overrides),
            None => Ok(Self::default()),
        }
    }

    /// Parse a complete quota table from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let overrides: QuotaOverrides = serde_yaml::from_str(yaml)
            .map_err(|e| FormguardError::Config(format!("Failed to parse quota table: {}", e)))?;
        Self::from_overrides(&overrides)
    }
}
