//! Configuration for the routing and apply engine.
//!
//! Configuration is passed to [`RoutingEngine::with_store()`](crate::RoutingEngine::with_store)
//! and can be built programmatically or deserialized from YAML/JSON.
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── node_id / node_group_id       # This node's identity
//! ├── settings: EngineSettings
//! │   ├── routing: RoutingConfig    # Pass interval, rate limiting
//! │   ├── gaps: GapConfig           # Gap window, staleness, purge
//! │   ├── reader: ReaderConfig      # Peek-ahead, take timeout, gap filter
//! │   └── writer: WriterConfig      # Early commit, apply-changes-only
//! ├── channels: Vec<ChannelConfig>  # Replication lanes and batch thresholds
//! ├── triggers / routers            # Which routers see which captured tables
//! ├── node_group_links / nodes      # Topology
//! ├── conflicts: Vec<ConflictSettings>
//! ├── topology / metadata           # Metadata routing switches, cache TTL
//! └── store: StoreConfig            # SQLite staging database
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! node_id: "corp-000"
//! node_group_id: "corp"
//!
//! settings:
//!   routing:
//!     interval: "5s"
//!   gaps:
//!     stale_gap_timeout: "20m"
//!   reader:
//!     take_timeout: "330s"
//!
//! channels:
//!   - channel_id: "sale_transaction"
//!     batch_algorithm: transactional
//!
//! routers:
//!   - router_id: "corp_to_store"
//!     source_group_id: "corp"
//!     target_group_id: "store"
//!     router: { type: column, expression: "STORE_ID=:EXTERNAL_ID" }
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::writer::conflict::ConflictSettings;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// The identity of the local node. Rows are never routed back to it.
    pub node_id: String,

    /// Node group of the local node.
    pub node_group_id: String,

    #[serde(default)]
    pub settings: EngineSettings,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,

    #[serde(default)]
    pub routers: Vec<RouterConfig>,

    #[serde(default)]
    pub node_group_links: Vec<NodeGroupLinkConfig>,

    /// Known nodes. The local node should appear here too so topology
    /// queries can place it in the tree.
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    /// Per-table conflict policies. An entry without `target_table` is the default.
    #[serde(default)]
    pub conflicts: Vec<ConflictSettings>,

    #[serde(default)]
    pub topology: TopologyConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: "000".to_string(),
            node_group_id: "corp".to_string(),
            settings: EngineSettings::default(),
            channels: vec![ChannelConfig::new("default")],
            triggers: Vec::new(),
            routers: Vec::new(),
            node_group_links: Vec::new(),
            nodes: Vec::new(),
            conflicts: Vec::new(),
            topology: TopologyConfig::default(),
            metadata: MetadataConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(node_id: &str, node_group_id: &str) -> Self {
        let mut settings = EngineSettings::default();
        settings.routing.interval = "50ms".to_string();
        settings.reader.take_timeout = "5s".to_string();
        Self {
            node_id: node_id.to_string(),
            node_group_id: node_group_id.to_string(),
            settings,
            store: StoreConfig::in_memory(),
            ..Default::default()
        }
    }

    /// Look up a channel by id.
    pub fn channel(&self, channel_id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.channel_id == channel_id)
    }

    /// Basic referential checks. Called once at engine start.
    pub fn validate(&self) -> crate::Result<()> {
        if self.node_id.is_empty() {
            return Err(crate::ReplicationError::Config("node_id must not be empty".into()));
        }
        for trigger in &self.triggers {
            if self.channel(&trigger.channel_id).is_none() {
                return Err(crate::ReplicationError::Config(format!(
                    "trigger {} references unknown channel {}",
                    trigger.trigger_id, trigger.channel_id
                )));
            }
            for router_id in &trigger.routers {
                if !self.routers.iter().any(|r| &r.router_id == router_id) {
                    return Err(crate::ReplicationError::Config(format!(
                        "trigger {} references unknown router {}",
                        trigger.trigger_id, router_id
                    )));
                }
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EngineSettings
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineSettings {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub gaps: GapConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub writer: WriterConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RoutingConfig: routing pass scheduling
// ═══════════════════════════════════════════════════════════════════════════════

/// Routing pass scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Whether the background routing loop runs. `route_once()` works either way.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time between routing passes (e.g. "5s").
    #[serde(default = "default_routing_interval")]
    pub interval: String,

    /// Maximum channels routed concurrently within one pass.
    #[serde(default = "default_max_concurrent_channels")]
    pub max_concurrent_channels: usize,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Throttle routed rows per second across all channels.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_routing_interval() -> String {
    "5s".to_string()
}

fn default_max_concurrent_channels() -> usize {
    4
}

fn default_rate_limit_per_sec() -> u32 {
    50_000
}

fn default_rate_limit_burst() -> u32 {
    5_000
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_routing_interval(),
            max_concurrent_channels: 4,
            rate_limit_enabled: false,
            rate_limit_per_sec: 50_000,
            rate_limit_burst: 5_000,
        }
    }
}

impl RoutingConfig {
    /// Parse the interval string to a Duration.
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(5))
    }

    /// Rate limit configuration, or `None` when disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GapConfig: gap detection
// ═══════════════════════════════════════════════════════════════════════════════

/// Gap detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapConfig {
    /// Size of the open-ended tail gap. Bounds the id range one pass will scan
    /// past the last known id.
    #[serde(default = "default_max_window")]
    pub max_window: i64,

    /// Age after which an empty gap is skipped even if the source cannot
    /// tell us whether transactions are still pending.
    #[serde(default = "default_stale_gap_timeout")]
    pub stale_gap_timeout: String,

    /// Tolerated clock skew between the gap's recorded create time and now.
    #[serde(default = "default_clock_sync_threshold")]
    pub clock_sync_threshold: String,

    /// Prune overlapping and nested gaps left behind by crashes.
    #[serde(default = "default_true")]
    pub detect_invalid_gaps: bool,

    /// How long CLOSED/SKIPPED gap rows are kept before purging.
    #[serde(default = "default_resolved_gap_retention")]
    pub resolved_gap_retention: String,

    /// How often the purge task runs.
    #[serde(default = "default_purge_interval")]
    pub purge_interval: String,
}

fn default_max_window() -> i64 {
    50_000_000
}

fn default_stale_gap_timeout() -> String {
    "20m".to_string()
}

fn default_clock_sync_threshold() -> String {
    "1m".to_string()
}

fn default_resolved_gap_retention() -> String {
    "1d".to_string()
}

fn default_purge_interval() -> String {
    "1h".to_string()
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            max_window: default_max_window(),
            stale_gap_timeout: default_stale_gap_timeout(),
            clock_sync_threshold: default_clock_sync_threshold(),
            detect_invalid_gaps: true,
            resolved_gap_retention: default_resolved_gap_retention(),
            purge_interval: default_purge_interval(),
        }
    }
}

impl GapConfig {
    pub fn stale_gap_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.stale_gap_timeout).unwrap_or(Duration::from_secs(20 * 60))
    }

    pub fn clock_sync_threshold_duration(&self) -> Duration {
        humantime::parse_duration(&self.clock_sync_threshold).unwrap_or(Duration::from_secs(60))
    }

    pub fn resolved_gap_retention_duration(&self) -> Duration {
        humantime::parse_duration(&self.resolved_gap_retention)
            .unwrap_or(Duration::from_secs(24 * 60 * 60))
    }

    pub fn purge_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.purge_interval).unwrap_or(Duration::from_secs(60 * 60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReaderConfig: gap-aware reader
// ═══════════════════════════════════════════════════════════════════════════════

/// Gap-aware reader settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    /// Rows buffered ahead of the router for transaction grouping.
    /// Also the capacity of the reader → router queue.
    #[serde(default = "default_peek_ahead_window")]
    pub peek_ahead_window: usize,

    /// How long `take()` waits for a row or the end-of-stream marker.
    #[serde(default = "default_take_timeout")]
    pub take_timeout: String,

    /// Above this many gaps the scan filter widens to one id range.
    #[serde(default = "default_max_gaps_to_qualify")]
    pub max_gaps_to_qualify: usize,

    /// Rows fetched per store query.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_peek_ahead_window() -> usize {
    2000
}

fn default_take_timeout() -> String {
    "330s".to_string()
}

fn default_max_gaps_to_qualify() -> usize {
    100
}

fn default_page_size() -> usize {
    1000
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            peek_ahead_window: default_peek_ahead_window(),
            take_timeout: default_take_timeout(),
            max_gaps_to_qualify: default_max_gaps_to_qualify(),
            page_size: default_page_size(),
        }
    }
}

impl ReaderConfig {
    pub fn take_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.take_timeout).unwrap_or(Duration::from_secs(330))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WriterConfig: conflict-aware apply
// ═══════════════════════════════════════════════════════════════════════════════

/// Apply-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Commit after this many uncommitted rows within one batch.
    #[serde(default = "default_max_rows_before_commit")]
    pub max_rows_before_commit: usize,

    /// Pause after each early commit (e.g. "10ms"). "0ms" disables.
    #[serde(default = "default_commit_sleep")]
    pub commit_sleep: String,

    /// Only update columns whose value differs from the captured old value.
    #[serde(default = "default_true")]
    pub apply_changes_only: bool,

    /// Batches applied concurrently by the batch loader.
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
}

fn default_max_rows_before_commit() -> usize {
    10_000
}

fn default_commit_sleep() -> String {
    "0ms".to_string()
}

fn default_max_concurrent_batches() -> usize {
    4
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_rows_before_commit: default_max_rows_before_commit(),
            commit_sleep: default_commit_sleep(),
            apply_changes_only: true,
            max_concurrent_batches: default_max_concurrent_batches(),
        }
    }
}

impl WriterConfig {
    pub fn commit_sleep_duration(&self) -> Duration {
        humantime::parse_duration(&self.commit_sleep).unwrap_or(Duration::ZERO)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Channels
// ═══════════════════════════════════════════════════════════════════════════════

/// How rows are grouped into outgoing batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchAlgorithm {
    /// Close on thresholds, but only between transactions.
    #[default]
    Default,
    /// One source transaction per batch.
    Transactional,
    /// Close on thresholds regardless of transaction boundaries.
    Nontransactional,
}

impl BatchAlgorithm {
    /// Whether the reader should group rows by transaction.
    pub fn groups_transactions(&self) -> bool {
        !matches!(self, BatchAlgorithm::Nontransactional)
    }
}

/// A replication lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: String,

    #[serde(default)]
    pub batch_algorithm: BatchAlgorithm,

    /// Data events per batch before it may close.
    #[serde(default = "default_channel_max_batch_size")]
    pub max_batch_size: usize,

    /// Payload bytes per batch before it may close. 0 disables.
    #[serde(default)]
    pub max_batch_bytes: u64,

    /// Batch age before it may close (e.g. "30s"). "0s" disables.
    #[serde(default = "default_max_batch_age")]
    pub max_batch_age: String,

    /// Rows read per channel per pass.
    #[serde(default = "default_max_data_to_route")]
    pub max_data_to_route: usize,

    /// Record rows as routed without sending them anywhere.
    #[serde(default = "default_false")]
    pub ignore_data: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_channel_max_batch_size() -> usize {
    1000
}

fn default_max_batch_age() -> String {
    "0s".to_string()
}

fn default_max_data_to_route() -> usize {
    100_000
}

impl ChannelConfig {
    pub fn new(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            batch_algorithm: BatchAlgorithm::Default,
            max_batch_size: default_channel_max_batch_size(),
            max_batch_bytes: 0,
            max_batch_age: default_max_batch_age(),
            max_data_to_route: default_max_data_to_route(),
            ignore_data: false,
            enabled: true,
        }
    }

    pub fn with_algorithm(mut self, algorithm: BatchAlgorithm) -> Self {
        self.batch_algorithm = algorithm;
        self
    }

    pub fn max_batch_age_duration(&self) -> Option<Duration> {
        humantime::parse_duration(&self.max_batch_age)
            .ok()
            .filter(|d| !d.is_zero())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Triggers and routers
// ═══════════════════════════════════════════════════════════════════════════════

/// A captured table and the routers its rows are offered to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub trigger_id: String,
    pub source_table: String,
    pub channel_id: String,
    #[serde(default)]
    pub routers: Vec<String>,
}

/// Router variant selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouterType {
    /// All enabled nodes of the target group.
    Default,
    /// Column-match expression, e.g. `STORE_ID=:EXTERNAL_ID or STATUS=ALL`.
    Column { expression: String },
    /// Query returning node ids; `:NODE_ID` and row columns are bindable.
    Subselect { expression: String },
    /// Match a row column against a lookup table that maps keys to nodes.
    LookupTable {
        lookup_table: String,
        key_column: String,
        lookup_key_column: String,
        external_id_column: String,
    },
    /// Delegate to a registered [`RouteScript`](crate::router::RouteScript).
    Scripted { script: String },
    /// Topology-aware routing for the engine's own configuration tables.
    Metadata,
}

impl Default for RouterType {
    fn default() -> Self {
        RouterType::Default
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub router_id: String,
    pub source_group_id: String,
    pub target_group_id: String,
    #[serde(default)]
    pub router: RouterType,
    #[serde(default = "default_true")]
    pub sync_on_insert: bool,
    #[serde(default = "default_true")]
    pub sync_on_update: bool,
    #[serde(default = "default_true")]
    pub sync_on_delete: bool,
    /// Allow rows to route back to the node they were captured from.
    #[serde(default = "default_false")]
    pub ping_back_enabled: bool,
}

impl RouterConfig {
    pub fn new(router_id: &str, source_group_id: &str, target_group_id: &str, router: RouterType) -> Self {
        Self {
            router_id: router_id.to_string(),
            source_group_id: source_group_id.to_string(),
            target_group_id: target_group_id.to_string(),
            router,
            sync_on_insert: true,
            sync_on_update: true,
            sync_on_delete: true,
            ping_back_enabled: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Topology
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroupLinkConfig {
    pub source_group_id: String,
    pub target_group_id: String,
    /// Whether configuration tables flow across this link.
    #[serde(default = "default_true")]
    pub sync_config_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub node_group_id: String,
    #[serde(default)]
    pub external_id: String,
    /// The node that registered this one. `None` for the root.
    #[serde(default)]
    pub created_at_node_id: Option<String>,
    #[serde(default = "default_true")]
    pub sync_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopologyConfig {
    /// Configuration changes flow between nodes at the same depth.
    #[serde(default)]
    pub master_to_master: bool,
}

/// Configuration tables and the metadata cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Prefix of the engine's configuration tables (`sym` → `sym_node`).
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Metadata cache time to live.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: String,
}

fn default_table_prefix() -> String {
    "sym".to_string()
}

fn default_cache_ttl() -> String {
    "60s".to_string()
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            table_prefix: default_table_prefix(),
            cache_ttl: default_cache_ttl(),
        }
    }
}

impl MetadataConfig {
    pub fn cache_ttl_duration(&self) -> Duration {
        humantime::parse_duration(&self.cache_ttl).unwrap_or(Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig: staging database
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite staging database holding captured rows, gaps and batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub sqlite_path: String,

    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_staging.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_config_defaults() {
        let config = GapConfig::default();
        assert_eq!(config.max_window, 50_000_000);
        assert_eq!(config.stale_gap_timeout_duration(), Duration::from_secs(1200));
        assert_eq!(config.clock_sync_threshold_duration(), Duration::from_secs(60));
        assert!(config.detect_invalid_gaps);
    }

    #[test]
    fn test_gap_config_invalid_duration_falls_back() {
        let config = GapConfig {
            stale_gap_timeout: "not a duration".to_string(),
            ..Default::default()
        };
        assert_eq!(config.stale_gap_timeout_duration(), Duration::from_secs(1200));
    }

    #[test]
    fn test_reader_take_timeout_parsing() {
        let mut config = ReaderConfig::default();
        assert_eq!(config.take_timeout_duration(), Duration::from_secs(330));

        config.take_timeout = "250ms".to_string();
        assert_eq!(config.take_timeout_duration(), Duration::from_millis(250));

        config.take_timeout = "2m".to_string();
        assert_eq!(config.take_timeout_duration(), Duration::from_secs(120));
    }

    #[test]
    fn test_routing_rate_limit_config() {
        let mut config = RoutingConfig::default();
        assert!(config.rate_limit_config().is_none());

        config.rate_limit_enabled = true;
        let rl = config.rate_limit_config().unwrap();
        assert_eq!(rl.refill_rate, 50_000);
        assert_eq!(rl.burst_size, 5_000);
    }

    #[test]
    fn test_writer_commit_sleep() {
        let mut config = WriterConfig::default();
        assert_eq!(config.commit_sleep_duration(), Duration::ZERO);
        config.commit_sleep = "15ms".to_string();
        assert_eq!(config.commit_sleep_duration(), Duration::from_millis(15));
    }

    #[test]
    fn test_channel_batch_age_disabled_by_default() {
        let channel = ChannelConfig::new("default");
        assert!(channel.max_batch_age_duration().is_none());

        let channel = ChannelConfig {
            max_batch_age: "30s".to_string(),
            ..ChannelConfig::new("default")
        };
        assert_eq!(channel.max_batch_age_duration(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_batch_algorithm_grouping() {
        assert!(BatchAlgorithm::Default.groups_transactions());
        assert!(BatchAlgorithm::Transactional.groups_transactions());
        assert!(!BatchAlgorithm::Nontransactional.groups_transactions());
    }

    #[test]
    fn test_router_type_deserializes_tagged() {
        let json = r#"{"router_id":"r1","source_group_id":"corp","target_group_id":"store",
            "router":{"type":"column","expression":"STORE_ID=:EXTERNAL_ID"}}"#;
        let router: RouterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            router.router,
            RouterType::Column {
                expression: "STORE_ID=:EXTERNAL_ID".to_string()
            }
        );
        assert!(router.sync_on_insert);
        assert!(!router.ping_back_enabled);
    }

    #[test]
    fn test_router_type_defaults_to_default() {
        let json = r#"{"router_id":"r1","source_group_id":"corp","target_group_id":"store"}"#;
        let router: RouterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(router.router, RouterType::Default);
    }

    #[test]
    fn test_for_testing_config() {
        let config = EngineConfig::for_testing("001", "store");
        assert_eq!(config.node_id, "001");
        assert_eq!(config.store.sqlite_path, ":memory:");
        assert_eq!(config.settings.routing.interval_duration(), Duration::from_millis(50));
        assert!(config.channel("default").is_some());
    }

    #[test]
    fn test_validate_rejects_unknown_channel() {
        let mut config = EngineConfig::for_testing("000", "corp");
        config.triggers.push(TriggerConfig {
            trigger_id: "item".into(),
            source_table: "item".into(),
            channel_id: "missing".into(),
            routers: vec![],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_router() {
        let mut config = EngineConfig::for_testing("000", "corp");
        config.triggers.push(TriggerConfig {
            trigger_id: "item".into(),
            source_table: "item".into(),
            channel_id: "default".into(),
            routers: vec!["nowhere".into()],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = EngineConfig::for_testing("000", "corp");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.node_id, "000");
        assert_eq!(parsed.channels.len(), 1);
        assert_eq!(parsed.settings.reader.take_timeout, "5s");
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let json = r#"{"node_id":"000","node_group_id":"corp"}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert!(config.channels.is_empty());
        assert_eq!(config.settings.reader.max_gaps_to_qualify, 100);
        assert_eq!(config.metadata.table_prefix, "sym");
    }
}
