//! Placement strategy seam.

use crate::engine::Engine;
use crate::types::ContainerConfig;
use rand::seq::SliceRandom;
use std::sync::Arc;

/// Picks an engine for a new container.
///
/// Implementations see only healthy engines; returning `None` means no
/// engine can host the container.
pub trait Scheduler: Send + Sync {
    /// Selects the target engine for `config`.
    fn select(&self, engines: &[Arc<Engine>], config: &ContainerConfig) -> Option<Arc<Engine>>;
}

/// Default strategy: spread load by committed resources.
///
/// Engines that cannot fit the container's memory request are skipped; the
/// least committed of the rest wins. Ties are broken randomly so identical
/// empty engines don't all receive the first burst of containers.
#[derive(Debug, Default)]
pub struct SpreadScheduler;

impl SpreadScheduler {
    /// Committed-resource score, lower is emptier. Fractions are scaled to
    /// integers so the comparison stays total.
    fn score(engine: &Engine) -> i64 {
        let cpu = ratio_permille(engine.used_cpus(), engine.total_cpus());
        let memory = ratio_permille(engine.used_memory(), engine.total_memory());
        cpu + memory
    }
}

fn ratio_permille(used: i64, total: i64) -> i64 {
    if total <= 0 {
        return 0;
    }
    used.saturating_mul(1000) / total
}

impl Scheduler for SpreadScheduler {
    fn select(&self, engines: &[Arc<Engine>], config: &ContainerConfig) -> Option<Arc<Engine>> {
        let requested_memory = config
            .host_config
            .as_ref()
            .map_or(0, |hc| hc.memory);

        let mut candidates: Vec<&Arc<Engine>> = engines
            .iter()
            .filter(|e| {
                requested_memory == 0
                    || e.used_memory() + requested_memory <= e.total_memory()
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .into_iter()
            .min_by_key(|e| Self::score(e))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{detail_with_shares, summary, MockClient};
    use crate::engine::EngineOptions;
    use crate::types::HostConfig;
    use std::time::Duration;

    async fn engine_with_load(id: &str, mem: i64, used: i64) -> Arc<Engine> {
        let client = Arc::new(MockClient::new(id, id, 4, mem));
        if used > 0 {
            client.set_containers(vec![summary("c1", "one")]);
            client.set_detail("c1", detail_with_shares("c1", 0, used));
        }
        let engine = Arc::new(Engine::new(
            format!("{id}:2375"),
            client,
            EngineOptions {
                refresh_interval: Duration::from_secs(3600),
                overcommit_ratio: 0.0,
            },
        ));
        engine.connect().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn spread_prefers_the_emptier_engine() {
        let busy = engine_with_load("busy", 4096, 3072).await;
        let idle = engine_with_load("idle", 4096, 0).await;
        let picked = SpreadScheduler
            .select(&[busy, idle], &ContainerConfig::default())
            .unwrap();
        assert_eq!(picked.id(), "idle");
    }

    #[tokio::test]
    async fn engines_without_room_are_skipped() {
        let full = engine_with_load("full", 1024, 1024).await;
        let config = ContainerConfig {
            host_config: Some(HostConfig {
                memory: 512,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(SpreadScheduler.select(&[full], &config).is_none());
    }

    #[tokio::test]
    async fn empty_engine_list_yields_none() {
        assert!(SpreadScheduler
            .select(&[], &ContainerConfig::default())
            .is_none());
    }
}
