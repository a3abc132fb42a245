// =============================================================================
// Shared types used across the arena engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a leveraged position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short. Multiplied into raw P&L.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Orchestrator lifecycle status.
///
/// Transitions: Idle -> Pending (create) -> Running (start) -> Paused ->
/// Running -> ... -> Stopping -> Idle. All other code paths observe the
/// current status and exit early when it is not Running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Pending,
    Running,
    Paused,
    Stopping,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Terminal status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Alive,
    Liquidated,
    Bankrupt,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alive => write!(f, "alive"),
            Self::Liquidated => write!(f, "liquidated"),
            Self::Bankrupt => write!(f, "bankrupt"),
        }
    }
}

/// Fixed health bands derived from health in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthZone {
    Safe,
    Caution,
    Danger,
    Critical,
    DeathRow,
    Dead,
}

impl HealthZone {
    /// Map a health value to its band. Bands: safe > 80, caution 60-80,
    /// danger 40-60, critical 20-40, death_row 0-20, dead <= 0.
    pub fn from_health(health: f64) -> Self {
        if health <= 0.0 {
            Self::Dead
        } else if health <= 20.0 {
            Self::DeathRow
        } else if health <= 40.0 {
            Self::Critical
        } else if health <= 60.0 {
            Self::Danger
        } else if health <= 80.0 {
            Self::Caution
        } else {
            Self::Safe
        }
    }

    /// Margin scale-down applied to new entries by health zone.
    pub fn margin_scale(self) -> f64 {
        match self {
            Self::Safe => 1.0,
            Self::Caution => 0.9,
            Self::Danger => 0.7,
            Self::Critical => 0.5,
            // Death row is the "last stand": full sizing, baseline threshold.
            Self::DeathRow => 1.0,
            Self::Dead => 0.0,
        }
    }
}

impl std::fmt::Display for HealthZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::Caution => write!(f, "caution"),
            Self::Danger => write!(f, "danger"),
            Self::Critical => write!(f, "critical"),
            Self::DeathRow => write!(f, "death_row"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// What an agent is visibly doing right now (cosmetic, for subscribers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Idle,
    Thinking,
    Trading,
    Holding,
    Waiting,
}

impl Default for Activity {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Thinking => write!(f, "thinking"),
            Self::Trading => write!(f, "trading"),
            Self::Holding => write!(f, "holding"),
            Self::Waiting => write!(f, "waiting"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
