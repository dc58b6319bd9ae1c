//! Default constants for kbshard configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Cluster Defaults
// =============================================================================

/// Number of replicas every logical shard must have.
pub const DEFAULT_REPLICA_FACTOR: usize = 1;

/// Primaries hosting this many replicas are considered saturated and are
/// skipped when placing new replicas.
pub const DEFAULT_MAX_REPLICAS_PER_NODE: usize = 800;

// =============================================================================
// Auto-split Defaults
// =============================================================================

/// Paragraph count above which the active shard is considered full.
pub const DEFAULT_MAX_SHARD_PARAGRAPHS: u64 = 500_000;

/// Field count above which the active shard is considered full.
pub const DEFAULT_MAX_SHARD_FIELDS: u64 = 200_000;

/// In cluster mode, one in this many commit notifications per knowledge box
/// triggers a shard size check.
pub const DEFAULT_AUTO_SPLIT_SAMPLE_EVERY: u64 = 10;

// =============================================================================
// Processor Defaults
// =============================================================================

/// Resources producing more paragraphs than this are not indexed.
pub const DEFAULT_MAX_PARAGRAPHS_PER_RESOURCE: usize = 50_000;

// =============================================================================
// RPC Defaults
// =============================================================================

/// Overall timeout for one parallel replica fan-out (milliseconds).
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;

// =============================================================================
// Rollover Defaults
// =============================================================================

/// Resources reindexed between two backlog checks. Must be greater than 10.
pub const DEFAULT_ROLLOVER_BATCH_SIZE: usize = 50;

/// Smallest batch size accepted by validation.
pub const MIN_ROLLOVER_BATCH_SIZE: usize = 11;

/// Pending deliveries a node may hold before rollover indexing pauses.
pub const DEFAULT_ROLLOVER_LOW_WATER_BACKLOG: u64 = 1_000;

/// Sleep between backlog polls while waiting for a node (milliseconds).
pub const DEFAULT_ROLLOVER_POLL_INTERVAL_MS: u64 = 500;

// =============================================================================
// Retry Defaults
// =============================================================================

/// Attempts for a replica write hitting an unsynchronized node.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// First backoff delay (milliseconds). Doubles on each attempt.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;

/// Backoff ceiling (milliseconds).
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 2_000;
