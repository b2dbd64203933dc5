//! Node configuration. Everything is optional; a node with no environment
//! at all self-configures with the defaults below.

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub metadata_alias: String,
    pub metadata_port: u16,
    pub alias_explicit: bool,

    pub gossip_period_secs: u64,
    pub gossip_fanout: usize,
    pub gossip_entry_cap: usize,
    pub gossip_deadline_secs: u64,

    pub anti_entropy_period_secs: u64,
    pub anti_entropy_deadline_secs: u64,

    pub repair_period_secs: u64,
    pub inflight_repairs: usize,

    pub health_period_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub storage_eviction_secs: u64,

    pub peer_refresh_secs: u64,
    pub peer_ttl_secs: u64,
    pub peer_reconcile_secs: u64,

    pub min_write_acks: usize,
    pub write_deadline_secs: u64,
    pub read_deadline_secs: u64,
    pub inflight_writes_per_sn: usize,

    pub chunk_size_bytes: usize,

    pub gc_period_secs: u64,
    pub tombstone_retention_secs: u64,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let alias = std::env::var("REDCLOUD_METADATA_ALIAS").ok();

        Self {
            alias_explicit: alias.is_some(),
            metadata_alias: alias.unwrap_or_else(|| common::METADATA_SERVICE_ALIAS.to_string()),
            metadata_port: env_parse("REDCLOUD_METADATA_PORT", common::METADATA_PORT),

            gossip_period_secs: env_parse("REDCLOUD_GOSSIP_PERIOD", 5),
            gossip_fanout: env_parse("REDCLOUD_GOSSIP_FANOUT", 2),
            gossip_entry_cap: env_parse("REDCLOUD_GOSSIP_ENTRY_CAP", 100),
            gossip_deadline_secs: env_parse("REDCLOUD_GOSSIP_DEADLINE", 5),

            anti_entropy_period_secs: env_parse("REDCLOUD_ANTI_ENTROPY_PERIOD", 30),
            anti_entropy_deadline_secs: env_parse("REDCLOUD_ANTI_ENTROPY_DEADLINE", 15),

            repair_period_secs: env_parse("REDCLOUD_REPAIR_PERIOD", 60),
            inflight_repairs: env_parse("REDCLOUD_INFLIGHT_REPAIRS", 32),

            health_period_secs: env_parse("REDCLOUD_HEALTH_PERIOD", 10),
            heartbeat_timeout_secs: env_parse("REDCLOUD_HEARTBEAT_TIMEOUT", 30),
            storage_eviction_secs: env_parse("REDCLOUD_STORAGE_EVICTION", 600),

            peer_refresh_secs: env_parse("REDCLOUD_PEER_REFRESH", 30),
            peer_ttl_secs: env_parse("REDCLOUD_PEER_TTL", 300),
            peer_reconcile_secs: env_parse("REDCLOUD_PEER_RECONCILE", 300),

            min_write_acks: env_parse("REDCLOUD_MIN_WRITE_ACKS", 1),
            write_deadline_secs: env_parse("REDCLOUD_WRITE_DEADLINE", 60),
            read_deadline_secs: env_parse("REDCLOUD_READ_DEADLINE", 60),
            inflight_writes_per_sn: env_parse("REDCLOUD_INFLIGHT_WRITES_PER_SN", 16),

            chunk_size_bytes: env_parse("REDCLOUD_CHUNK_SIZE", common::CHUNK_SIZE_BYTES),

            gc_period_secs: env_parse("REDCLOUD_GC_PERIOD", 60),
            // 0 keeps tombstones for the cluster session lifetime.
            tombstone_retention_secs: env_parse("REDCLOUD_TOMBSTONE_RETENTION_SECS", 0),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}
