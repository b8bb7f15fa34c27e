// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metadata cache.
//!
//! Routing needs the trigger → router wiring, channel settings and group
//! links on every row. They are resolved once from the latest config and
//! cached for `metadata.cache_ttl`. The metadata router flushes the cache
//! when configuration rows pass through it, so the next pass sees them.

use crate::config::{ChannelConfig, EngineConfig, RouterConfig, TriggerConfig};
use crate::model::NodeGroupLink;
use crate::writer::conflict::ConflictSettings;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::debug;

/// A router attached to a trigger.
#[derive(Debug, Clone)]
pub struct TriggerRouter {
    pub trigger: TriggerConfig,
    pub router: RouterConfig,
}

/// Resolved routing metadata at one point in time.
#[derive(Debug, Clone, Default)]
pub struct RoutingMetadata {
    channels: HashMap<String, ChannelConfig>,
    trigger_routers: HashMap<String, Vec<TriggerRouter>>,
    links: Vec<NodeGroupLink>,
    conflicts: Vec<ConflictSettings>,
}

impl RoutingMetadata {
    /// Resolve config for the local node group. Routers whose source group
    /// is not ours are dropped.
    pub fn resolve(config: &EngineConfig) -> Self {
        let channels = config
            .channels
            .iter()
            .map(|c| (c.channel_id.clone(), c.clone()))
            .collect();

        let mut trigger_routers: HashMap<String, Vec<TriggerRouter>> = HashMap::new();
        for trigger in &config.triggers {
            let routers = trigger
                .routers
                .iter()
                .filter_map(|id| config.routers.iter().find(|r| &r.router_id == id))
                .filter(|r| r.source_group_id == config.node_group_id)
                .map(|router| TriggerRouter {
                    trigger: trigger.clone(),
                    router: router.clone(),
                })
                .collect();
            trigger_routers.insert(trigger.trigger_id.clone(), routers);
        }

        let links = config
            .node_group_links
            .iter()
            .map(|l| NodeGroupLink {
                source_group_id: l.source_group_id.clone(),
                target_group_id: l.target_group_id.clone(),
                sync_config_enabled: l.sync_config_enabled,
            })
            .collect();

        Self {
            channels,
            trigger_routers,
            links,
            conflicts: config.conflicts.clone(),
        }
    }

    pub fn channel(&self, channel_id: &str) -> Option<&ChannelConfig> {
        self.channels.get(channel_id)
    }

    /// Enabled channels, ordered by id.
    pub fn enabled_channels(&self) -> Vec<ChannelConfig> {
        let mut channels: Vec<ChannelConfig> =
            self.channels.values().filter(|c| c.enabled).cloned().collect();
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        channels
    }

    pub fn trigger_routers_for(&self, trigger_id: &str) -> &[TriggerRouter] {
        self.trigger_routers
            .get(trigger_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn links(&self) -> &[NodeGroupLink] {
        &self.links
    }

    pub fn conflicts(&self) -> &[ConflictSettings] {
        &self.conflicts
    }
}

struct CachedMetadata {
    metadata: Arc<RoutingMetadata>,
    expires_at: Instant,
}

/// TTL cache over [`RoutingMetadata`], fed by the config watch channel.
pub struct MetadataCache {
    config_rx: watch::Receiver<EngineConfig>,
    ttl: Duration,
    cached: RwLock<Option<CachedMetadata>>,
    loads: AtomicU64,
}

impl MetadataCache {
    pub fn new(config_rx: watch::Receiver<EngineConfig>) -> Self {
        let ttl = config_rx.borrow().metadata.cache_ttl_duration();
        Self {
            config_rx,
            ttl,
            cached: RwLock::new(None),
            loads: AtomicU64::new(0),
        }
    }

    /// Current metadata, reloaded when expired or flushed.
    pub async fn metadata(&self) -> Arc<RoutingMetadata> {
        {
            let cached = self.cached.read().await;
            if let Some(ref entry) = *cached {
                if Instant::now() < entry.expires_at {
                    return Arc::clone(&entry.metadata);
                }
            }
        }

        let metadata = Arc::new(RoutingMetadata::resolve(&self.config_rx.borrow()));
        self.loads.fetch_add(1, Ordering::Relaxed);
        debug!(ttl_ms = self.ttl.as_millis() as u64, "Metadata cache reloaded");

        let mut cached = self.cached.write().await;
        *cached = Some(CachedMetadata {
            metadata: Arc::clone(&metadata),
            expires_at: Instant::now() + self.ttl,
        });
        metadata
    }

    /// Drop the cached entry. The next read reloads from config.
    pub async fn flush(&self) {
        *self.cached.write().await = None;
        debug!("Metadata cache flushed");
    }

    /// Number of reloads since creation.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterType;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::for_testing("000", "corp");
        config.routers.push(RouterConfig::new("corp_to_store", "corp", "store", RouterType::Default));
        config.routers.push(RouterConfig::new("store_to_corp", "store", "corp", RouterType::Default));
        config.triggers.push(TriggerConfig {
            trigger_id: "item".into(),
            source_table: "item".into(),
            channel_id: "default".into(),
            routers: vec!["corp_to_store".into(), "store_to_corp".into()],
        });
        config
    }

    #[test]
    fn test_resolve_keeps_routers_of_local_group() {
        let metadata = RoutingMetadata::resolve(&config());
        let routers = metadata.trigger_routers_for("item");
        assert_eq!(routers.len(), 1);
        assert_eq!(routers[0].router.router_id, "corp_to_store");
        assert!(metadata.trigger_routers_for("unknown").is_empty());
        assert_eq!(metadata.enabled_channels().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let (_tx, rx) = watch::channel(config());
        let cache = MetadataCache::new(rx);

        cache.metadata().await;
        cache.metadata().await;
        assert_eq!(cache.load_count(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.metadata().await;
        assert_eq!(cache.load_count(), 2);
    }

    #[tokio::test]
    async fn test_flush_picks_up_new_config() {
        let (tx, rx) = watch::channel(config());
        let cache = MetadataCache::new(rx);
        assert!(cache.metadata().await.channel("sale").is_none());

        let mut updated = config();
        updated.channels.push(ChannelConfig::new("sale"));
        tx.send(updated).unwrap();

        // Still cached
        assert!(cache.metadata().await.channel("sale").is_none());

        cache.flush().await;
        assert!(cache.metadata().await.channel("sale").is_some());
    }
}
