use std::sync::Arc;
use std::time::Duration;

use storage_cache::CacheClient;
use storage_settings::Settings;

use crate::backend::{BackendDirectory, PingableBackend};
use crate::status::{HealthKeys, HealthStatus};

/// Scheduling knobs for the Backend Health Monitor, read once from
/// [`Settings`] at startup and re-used for the life of the process. The
/// backend *list* itself, by contrast, is re-read every iteration via
/// [`BackendDirectory`] (spec.md §4.7).
#[derive(Clone, Copy, Debug)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    pub ping_timeout: Duration,
}

impl From<&Settings> for MonitorConfig {
    fn from(settings: &Settings) -> Self {
        MonitorConfig {
            check_interval: Duration::from_secs(settings.health_check_interval as u64),
            ping_timeout: Duration::from_secs(settings.health_check_timeout as u64),
        }
    }
}

/// Runs the health check loop forever: one pass over every backend the
/// directory currently reports, a sleep of `check_interval`, repeat.
pub async fn run_forever(
    directory: Arc<dyn BackendDirectory>,
    cache: CacheClient,
    config: MonitorConfig,
) -> ! {
    loop {
        let backends = directory.backends().await;
        for backend in &backends {
            check_one(backend.as_ref(), &cache, config.ping_timeout).await;
        }
        tokio::time::sleep(config.check_interval).await;
    }
}

/// Pings one backend and, unless its published status is a manual
/// `down` override, CASes the status to match what was observed.
async fn check_one(backend: &dyn PingableBackend, cache: &CacheClient, ping_timeout: Duration) {
    let observed = match tokio::time::timeout(ping_timeout, backend.ping()).await {
        Ok(Ok(())) => HealthStatus::Ok,
        Ok(Err(e)) => {
            warn!("health monitor: ping failed"; "backend" => backend.name(), "error" => %e);
            HealthStatus::Unhealthy
        }
        Err(_) => {
            warn!("health monitor: ping timed out"; "backend" => backend.name());
            HealthStatus::Unhealthy
        }
    };

    let key = HealthKeys::status(backend.name());
    let current = match cache.get_with_cas::<HealthStatus>(&key).await {
        Ok(current) => current,
        Err(e) => {
            warn!("health monitor: cache read failed"; "backend" => backend.name(), "error" => %e);
            return;
        }
    };

    match current {
        None => {
            if let Err(e) = cache.add(&key, &observed).await {
                warn!("health monitor: failed to publish initial status"; "backend" => backend.name(), "error" => %e);
            }
        }
        Some((status, _)) if status.is_down() => {
            // A manual override; the monitor never clobbers it.
        }
        Some((status, token)) if status != observed => {
            if let Err(e) = cache.cas(&key, &token, &observed).await {
                warn!("health monitor: failed to publish status transition"; "backend" => backend.name(), "error" => %e);
            }
        }
        Some(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn config_from_settings_matches_defaults() {
        let settings = Settings::default();
        let config = MonitorConfig::from(&settings);
        assert_eq!(config.check_interval, StdDuration::from_secs(60));
        assert_eq!(config.ping_timeout, StdDuration::from_secs(30));
    }
}
