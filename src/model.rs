//! # Data Model
//!
//! Knowledge boxes, shard catalogs, resources and the broker messages that
//! mutate them. Everything here is persisted with bincode or carried over
//! the wire, so all types derive serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Knowledge box (tenant) identifier
    KbId
);
string_id!(
    /// Resource identifier, unique within a knowledge box
    ResourceId
);
string_id!(
    /// Index node identifier
    NodeId
);
string_id!(
    /// Logical shard identifier
    ShardId
);
string_id!(
    /// Physical replica identifier, as returned by an index node
    ReplicaId
);

impl ShardId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

/// Vector similarity function configured for a knowledge box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorSimilarity {
    #[default]
    Cosine,
    Dot,
}

/// Embedding model metadata stored with the shard catalog.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SemanticModel {
    pub similarity: VectorSimilarity,
    pub vector_dimension: Option<u32>,
    pub model_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseChannel {
    #[default]
    Stable,
    Experimental,
}

/// Per-knowledge-box settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBoxConfig {
    pub kbid: KbId,
    pub slug: String,
    pub semantic_model: SemanticModel,
    pub release_channel: ReleaseChannel,
    /// Index through an external provider instead of index nodes.
    pub external_index: bool,
}

impl KnowledgeBoxConfig {
    pub fn new(kbid: KbId) -> Self {
        Self {
            slug: kbid.0.clone(),
            kbid,
            semantic_model: SemanticModel::default(),
            release_channel: ReleaseChannel::default(),
            external_index: false,
        }
    }
}

/// One physical copy of a logical shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardReplica {
    pub node: NodeId,
    pub replica: ReplicaId,
}

/// A logical shard and its replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardObject {
    pub shard: ShardId,
    pub replicas: Vec<ShardReplica>,
    pub read_only: bool,
}

impl ShardObject {
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            replicas: Vec::new(),
            read_only: false,
        }
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.replicas.iter().map(|replica| &replica.node)
    }
}

/// The shard catalog of one knowledge box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shards {
    pub kbid: KbId,
    pub shards: Vec<ShardObject>,
    /// Index into `shards` of the shard receiving new resources.
    pub actual: Option<usize>,
    pub semantic_model: SemanticModel,
    pub release_channel: ReleaseChannel,
}

impl Shards {
    pub fn new(kbid: KbId, semantic_model: SemanticModel, release_channel: ReleaseChannel) -> Self {
        Self {
            kbid,
            shards: Vec::new(),
            actual: None,
            semantic_model,
            release_channel,
        }
    }

    pub fn actual_shard(&self) -> Option<&ShardObject> {
        self.actual.and_then(|idx| self.shards.get(idx))
    }

    pub fn find(&self, shard: &ShardId) -> Option<&ShardObject> {
        self.shards.iter().find(|candidate| &candidate.shard == shard)
    }

    pub fn position(&self, shard: &ShardId) -> Option<usize> {
        self.shards.iter().position(|candidate| &candidate.shard == shard)
    }

    /// Append a fully formed shard and make it the active one.
    pub fn push_active(&mut self, shard: ShardObject) {
        self.shards.push(shard);
        self.actual = Some(self.shards.len() - 1);
    }

    /// Every node hosting a replica of any shard in the catalog.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .shards
            .iter()
            .flat_map(|shard| shard.node_ids().cloned())
            .collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    Pending,
    Processed,
    Error,
}

impl ResourceStatus {
    pub fn label(self) -> &'static str {
        match self {
            ResourceStatus::Pending => "/n/s/PENDING",
            ResourceStatus::Processed => "/n/s/PROCESSED",
            ResourceStatus::Error => "/n/s/ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Link,
    File,
    Conversation,
    Generic,
    Generated,
}

impl FieldType {
    fn prefix(self) -> char {
        match self {
            FieldType::Text => 't',
            FieldType::Link => 'u',
            FieldType::File => 'f',
            FieldType::Conversation => 'c',
            FieldType::Generic => 'a',
            FieldType::Generated => 'd',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId {
    pub field_type: FieldType,
    pub name: String,
}

impl FieldId {
    pub fn new(field_type: FieldType, name: impl Into<String>) -> Self {
        Self {
            field_type,
            name: name.into(),
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(FieldType::Text, name)
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.field_type.prefix(), self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldErrorCode {
    Index,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub code: FieldErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub from: String,
    pub to: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Field {
    /// Raw value submitted by the writer.
    pub value: Option<String>,
    /// Text extracted by background processing.
    pub extracted_text: Option<String>,
    /// One vector per paragraph of the extracted text.
    pub vectors: Vec<Vec<f32>>,
    pub relations: Vec<Relation>,
    pub error: Option<FieldError>,
}

impl Field {
    /// Text used for indexing: extracted text when present, raw value otherwise.
    pub fn indexable_text(&self) -> Option<&str> {
        self.extracted_text.as_deref().or(self.value.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Basic {
    pub title: String,
    pub summary: String,
    pub labels: Vec<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub status: ResourceStatus,
}

/// The unit of storage of a knowledge box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kbid: KbId,
    pub uuid: ResourceId,
    pub slug: Option<String>,
    pub basic: Basic,
    pub fields: BTreeMap<FieldId, Field>,
    /// Set when the aggregate was mutated in the current transaction.
    #[serde(skip)]
    pub modified: bool,
}

impl Resource {
    pub fn new(kbid: KbId, uuid: ResourceId, now: DateTime<Utc>) -> Self {
        Self {
            kbid,
            uuid,
            slug: None,
            basic: Basic {
                title: String::new(),
                summary: String::new(),
                labels: Vec::new(),
                created: now,
                modified: now,
                status: ResourceStatus::Pending,
            },
            fields: BTreeMap::new(),
            modified: false,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        // Strictly increasing so rollover validation never misses a write.
        self.basic.modified = if now > self.basic.modified {
            now
        } else {
            self.basic.modified + chrono::Duration::microseconds(1)
        };
        self.modified = true;
    }

    pub fn field_mut(&mut self, id: &FieldId) -> &mut Field {
        self.fields.entry(id.clone()).or_default()
    }

    pub fn field_errors(&self) -> Vec<(FieldId, FieldError)> {
        self.fields
            .iter()
            .filter_map(|(id, field)| field.error.clone().map(|error| (id.clone(), error)))
            .collect()
    }
}

/// Search-optimised projection of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub uuid: ResourceId,
    pub slug: Option<String>,
    pub title: String,
    pub labels: Vec<String>,
    pub status: ResourceStatus,
    pub modified: DateTime<Utc>,
    pub field_count: usize,
    pub shard: Option<ShardId>,
}

impl CatalogEntry {
    pub fn from_resource(resource: &Resource, shard: Option<ShardId>) -> Self {
        Self {
            uuid: resource.uuid.clone(),
            slug: resource.slug.clone(),
            title: resource.basic.title.clone(),
            labels: resource.basic.labels.clone(),
            status: resource.basic.status,
            modified: resource.basic.modified,
            field_count: resource.fields.len(),
            shard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Autocommit,
    Delete,
    Multi,
    Commit,
    Rollback,
}

/// Who produced a broker message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    #[default]
    Writer,
    Processor,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicUpdate {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub labels: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub field: FieldId,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub field: FieldId,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldVectors {
    pub field: FieldId,
    pub vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRelations {
    pub field: FieldId,
    pub relations: Vec<Relation>,
}

/// A field produced by background processing that needs processing itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedField {
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingError {
    pub field: FieldId,
    pub message: String,
}

/// A typed delta against one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerMessage {
    pub kbid: KbId,
    pub uuid: ResourceId,
    pub slug: Option<String>,
    pub message_type: MessageType,
    pub source: MessageSource,
    pub transaction_id: Option<String>,
    pub processing_id: Option<String>,
    pub reindex: bool,
    pub basic: Option<BasicUpdate>,
    pub fields: Vec<FieldUpdate>,
    pub delete_fields: Vec<FieldId>,
    pub extracted_text: Vec<ExtractedText>,
    pub vectors: Vec<FieldVectors>,
    pub relations: Vec<FieldRelations>,
    pub generated: Vec<GeneratedField>,
    pub errors: Vec<ProcessingError>,
}

impl Default for BrokerMessage {
    fn default() -> Self {
        Self {
            kbid: KbId::default(),
            uuid: ResourceId::default(),
            slug: None,
            message_type: MessageType::Autocommit,
            source: MessageSource::Writer,
            transaction_id: None,
            processing_id: None,
            reindex: false,
            basic: None,
            fields: Vec::new(),
            delete_fields: Vec::new(),
            extracted_text: Vec::new(),
            vectors: Vec::new(),
            relations: Vec::new(),
            generated: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl BrokerMessage {
    pub fn autocommit(kbid: KbId, uuid: ResourceId, source: MessageSource) -> Self {
        Self {
            kbid,
            uuid,
            source,
            transaction_id: Some(uuid::Uuid::new_v4().simple().to_string()),
            ..Self::default()
        }
    }

    pub fn delete(kbid: KbId, uuid: ResourceId) -> Self {
        Self {
            kbid,
            uuid,
            message_type: MessageType::Delete,
            transaction_id: Some(uuid::Uuid::new_v4().simple().to_string()),
            ..Self::default()
        }
    }

    pub fn with_text_field(mut self, name: &str, value: &str) -> Self {
        self.fields.push(FieldUpdate {
            field: FieldId::text(name),
            value: value.to_string(),
        });
        self
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.basic.get_or_insert_with(BasicUpdate::default).title = Some(title.to_string());
        self
    }

    pub fn with_slug(mut self, slug: &str) -> Self {
        self.slug = Some(slug.to_string());
        self
    }

    pub fn with_extracted_text(mut self, field: FieldId, text: &str) -> Self {
        self.extracted_text.push(ExtractedText {
            field,
            text: text.to_string(),
        });
        self
    }
}

/// Kind of change reported in a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteType {
    Created,
    Modified,
    Deleted,
    Unset,
}
