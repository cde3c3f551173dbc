//! Engine configuration.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{AgendaError, Result};
use crate::scope::Scope;

/// Tunables shared by the expander and the query service.
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The single canonical IANA zone all dates and times are expressed in.
    pub timezone: String,
    /// Widest `[start, end]` window a caller may request, in days.
    pub max_range_days: u32,
    /// Scope used when a mutation does not name one.
    pub default_scope: Scope,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            max_range_days: 1096,
            default_scope: Scope::Single,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns `AgendaError::InvalidTimezone` if `timezone` is not an IANA name.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse()
            .map_err(|_| AgendaError::InvalidTimezone(self.timezone.clone()))
    }

    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        if self.max_range_days == 0 {
            return Err(AgendaError::validation("max_range_days must be at least 1"));
        }
        Ok(())
    }
}
