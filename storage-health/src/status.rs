use serde::{Deserialize, Serialize};

/// Per-host health, as published to the cache (spec.md §4.7). `Down` is
/// a manual override by operator tooling; the monitor only ever
/// transitions between `Ok` and `Unhealthy` on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
    Down,
}

impl HealthStatus {
    pub fn is_down(&self) -> bool {
        matches!(self, HealthStatus::Down)
    }
}

pub struct HealthKeys;

impl HealthKeys {
    pub fn status(host: &str) -> String {
        format!("health:{host}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_lowercase_for_operator_tooling() {
        assert_eq!(serde_json::to_string(&HealthStatus::Down).unwrap(), "\"down\"");
        assert_eq!(serde_json::to_string(&HealthStatus::Unhealthy).unwrap(), "\"unhealthy\"");
    }

    #[test]
    fn only_down_reports_is_down() {
        assert!(HealthStatus::Down.is_down());
        assert!(!HealthStatus::Ok.is_down());
        assert!(!HealthStatus::Unhealthy.is_down());
    }
}
