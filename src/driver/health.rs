//! Connection health classification

use crate::config::HealthConfig;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHealth {
    #[default]
    Healthy,
    /// Connected but quiet for longer than the degraded threshold
    Degraded,
    /// Waiting to reconnect, or the last stream failed for good
    Unhealthy,
}

impl ConnectionHealth {
    /// Classify a live stream from how long it has been quiet
    pub fn classify(idle: Duration, retrying: bool, config: &HealthConfig) -> Self {
        if retrying {
            Self::Unhealthy
        } else if idle > config.degraded_after {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }
}

impl fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}
