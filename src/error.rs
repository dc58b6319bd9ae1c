//! Error taxonomy for shard placement, rollover and write processing.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoordError>;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("cluster too small: {available} eligible primaries, replica factor {required}")]
    ClusterTooSmall { required: usize, available: usize },

    #[error("exhausted nodes: created {created} of {required} replicas")]
    ExhaustedNodes { required: usize, created: usize },

    #[error("no healthy node for shard {0}")]
    NoHealthyNode(String),

    #[error("nodes unsynchronized: {0}")]
    NodesUnsynchronized(String),

    #[error("node {node} unavailable: {reason}")]
    NodeUnavailable { node: String, reason: String },

    #[error("sequence order violation: last applied seqid is {last_seqid}")]
    SequenceOrderViolation { last_seqid: u64 },

    #[error("resource not indexable: {0}")]
    ResourceNotIndexable(String),

    #[error("unexpected rollover state: {0}")]
    UnexpectedRollover(String),

    #[error("message deadlettered (partition {partition}, seqid {seqid}): {source}")]
    Deadlettered {
        partition: String,
        seqid: u64,
        #[source]
        source: Box<CoordError>,
    },

    #[error("transaction conflict on key {0}")]
    TransactionConflict(String),

    #[error("knowledge box {0} not found")]
    KnowledgeBoxNotFound(String),

    #[error("knowledge box {0} already exists")]
    KnowledgeBoxExists(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("rpc error on node {node}: {message}")]
    Rpc { node: String, message: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoordError {
    /// Transient replica condition worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordError::NodesUnsynchronized(_))
    }

    /// Placement could not be satisfied with the current cluster size,
    /// as opposed to a node failing an RPC.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            CoordError::ClusterTooSmall { .. } | CoordError::ExhaustedNodes { .. }
        )
    }

    /// Short code used in notifications and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CoordError::ClusterTooSmall { .. } => "CLUSTER_TOO_SMALL",
            CoordError::ExhaustedNodes { .. } => "EXHAUSTED_NODES",
            CoordError::NoHealthyNode(_) => "NO_HEALTHY_NODE",
            CoordError::NodesUnsynchronized(_) => "NODES_UNSYNCHRONIZED",
            CoordError::NodeUnavailable { .. } => "NODE_UNAVAILABLE",
            CoordError::SequenceOrderViolation { .. } => "SEQUENCE_ORDER_VIOLATION",
            CoordError::ResourceNotIndexable(_) => "RESOURCE_NOT_INDEXABLE",
            CoordError::UnexpectedRollover(_) => "UNEXPECTED_ROLLOVER",
            CoordError::Deadlettered { .. } => "DEADLETTERED",
            CoordError::TransactionConflict(_) => "TRANSACTION_CONFLICT",
            CoordError::KnowledgeBoxNotFound(_) => "KB_NOT_FOUND",
            CoordError::KnowledgeBoxExists(_) => "KB_EXISTS",
            CoordError::Unsupported(_) => "UNSUPPORTED",
            CoordError::InvalidMessage(_) => "INVALID_MESSAGE",
            CoordError::Rpc { .. } => "RPC_ERROR",
            CoordError::Store(_) => "STORE_ERROR",
            CoordError::Codec(_) => "CODEC_ERROR",
            CoordError::Json(_) => "JSON_ERROR",
        }
    }

    pub fn rpc(node: impl Into<String>, message: impl Into<String>) -> Self {
        CoordError::Rpc {
            node: node.into(),
            message: message.into(),
        }
    }
}

impl From<rocksdb::Error> for CoordError {
    fn from(e: rocksdb::Error) -> Self {
        CoordError::Store(e.to_string())
    }
}
