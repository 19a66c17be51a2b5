use std::time::Duration;

use storage_settings::Settings;
use storage_types::params;

use crate::backend::ReapableBackend;

/// Safety cap on how many times a single backend is re-swept within one
/// pass before giving up and deferring the rest to the next pass. Guards
/// against a backlog that refills faster than `max_per_loop` can drain
/// it, which would otherwise starve every other configured backend.
const MAX_SWEEPS_PER_BACKEND: u32 = 1000;

/// Scheduling knobs for the TTL Reaper, read once from [`Settings`] at
/// startup and re-used for the life of the process.
#[derive(Clone, Copy, Debug)]
pub struct ReaperConfig {
    pub grace_period: u32,
    pub max_per_loop: u32,
    pub backend_sleep: Duration,
    pub pass_interval: Duration,
}

impl From<&Settings> for ReaperConfig {
    fn from(settings: &Settings) -> Self {
        ReaperConfig {
            grace_period: settings.purge_grace_period,
            max_per_loop: settings.purge_max_per_loop,
            backend_sleep: Duration::from_secs(settings.purge_backend_sleep as u64),
            pass_interval: Duration::from_secs(settings.purge_interval as u64),
        }
    }
}

/// Runs the purge sweep forever: one full pass over every backend, a
/// sleep of `pass_interval`, then the next pass. Never returns.
pub async fn run_forever(backends: Vec<Box<dyn ReapableBackend>>, config: ReaperConfig) -> ! {
    loop {
        purge_once(&backends, &config).await;
        tokio::time::sleep(config.pass_interval).await;
    }
}

/// Runs a single pass over every backend, sleeping `backend_sleep`
/// between them. A backend that errors out is logged and skipped; it
/// does not halt the sweep over the remaining backends.
pub async fn purge_once(backends: &[Box<dyn ReapableBackend>], config: &ReaperConfig) {
    for (i, backend) in backends.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(config.backend_sleep).await;
        }
        purge_backend_fully(backend.as_ref(), config).await;
    }
}

/// Re-sweeps a single backend until it reports `is_complete` or the
/// safety cap is hit, accumulating the total rows purged for logging.
async fn purge_backend_fully(backend: &dyn ReapableBackend, config: &ReaperConfig) {
    let mut total_purged = 0u64;

    for _ in 0..MAX_SWEEPS_PER_BACKEND {
        let params = params::PurgeExpiredItems {
            grace_period: config.grace_period,
            max_per_loop: config.max_per_loop,
        };

        match backend.purge(params).await {
            Ok(result) => {
                total_purged += result.num_purged;
                if result.is_complete {
                    if total_purged > 0 {
                        info!("ttl reaper: purge complete"; "backend" => backend.name(), "purged" => total_purged);
                    }
                    return;
                }
            }
            Err(e) => {
                warn!("ttl reaper: purge failed, deferring to next pass"; "backend" => backend.name(), "error" => %e);
                return;
            }
        }
    }

    warn!(
        "ttl reaper: backend still incomplete after max sweeps, deferring rest to next pass";
        "backend" => backend.name(),
        "purged" => total_purged,
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::error::ReaperError;
    use storage_types::results;

    struct CountingBackend {
        name: &'static str,
        calls: Arc<AtomicU64>,
        // one scripted result per call; the last entry repeats once exhausted
        script: Mutex<Vec<Result<results::PurgeExpiredItems, String>>>,
    }

    #[async_trait]
    impl ReapableBackend for CountingBackend {
        fn name(&self) -> &str {
            self.name
        }

        async fn purge(
            &self,
            _params: params::PurgeExpiredItems,
        ) -> Result<results::PurgeExpiredItems, ReaperError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            };
            next.map_err(|e| ReaperError::new(self.name, e))
        }
    }

    fn config() -> ReaperConfig {
        ReaperConfig {
            grace_period: 86_400,
            max_per_loop: 1000,
            backend_sleep: Duration::from_millis(0),
            pass_interval: Duration::from_millis(0),
        }
    }

    #[tokio::test]
    async fn resweeps_until_complete() {
        let calls = Arc::new(AtomicU64::new(0));
        let backend = CountingBackend {
            name: "a",
            calls: calls.clone(),
            script: Mutex::new(vec![
                Ok(results::PurgeExpiredItems {
                    num_purged: 1000,
                    is_complete: false,
                }),
                Ok(results::PurgeExpiredItems {
                    num_purged: 10,
                    is_complete: true,
                }),
            ]),
        };
        purge_backend_fully(&backend, &config()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn one_backend_error_does_not_abort_the_pass() {
        let failing_calls = Arc::new(AtomicU64::new(0));
        let healthy_calls = Arc::new(AtomicU64::new(0));
        let failing = CountingBackend {
            name: "failing",
            calls: failing_calls.clone(),
            script: Mutex::new(vec![Err("backend unreachable".to_owned())]),
        };
        let healthy = CountingBackend {
            name: "healthy",
            calls: healthy_calls.clone(),
            script: Mutex::new(vec![Ok(results::PurgeExpiredItems {
                num_purged: 0,
                is_complete: true,
            })]),
        };
        let backends: Vec<Box<dyn ReapableBackend>> = vec![Box::new(failing), Box::new(healthy)];
        purge_once(&backends, &config()).await;
        assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy_calls.load(Ordering::SeqCst), 1);
    }
}
