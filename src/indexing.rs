//! # Index Message Builder
//!
//! Derives the index-node payload for a resource: one text block per field,
//! paragraphs split on non-empty lines (with vectors attached by position),
//! relations and labels. The payload is rebuilt from the resource on every
//! transaction and is never persisted.

use crate::error::{CoordError, Result};
use crate::model::{FieldId, KbId, Relation, Resource, ResourceId, ResourceStatus, ShardId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const STATUS_LABEL_PREFIX: &str = "/n/s/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexParagraph {
    pub field: String,
    pub index: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub vector: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMessage {
    pub kbid: KbId,
    pub resource: ResourceId,
    /// Logical shard the message is routed to, once assigned.
    pub shard: Option<ShardId>,
    pub txid: Option<String>,
    pub partition: Option<String>,
    pub labels: Vec<String>,
    pub texts: BTreeMap<String, String>,
    pub paragraphs: Vec<IndexParagraph>,
    pub relations: Vec<Relation>,
    pub modified: DateTime<Utc>,
}

impl IndexMessage {
    pub fn from_resource(resource: &Resource) -> Self {
        let mut texts = BTreeMap::new();
        let mut paragraphs = Vec::new();
        let mut relations = Vec::new();

        for (id, field) in &resource.fields {
            relations.extend(field.relations.iter().cloned());
            let Some(text) = field.indexable_text() else {
                continue;
            };
            let key = id.to_string();
            paragraphs.extend(split_paragraphs(&key, text, &field.vectors));
            texts.insert(key, text.to_string());
        }

        let mut message = Self {
            kbid: resource.kbid.clone(),
            resource: resource.uuid.clone(),
            shard: None,
            txid: None,
            partition: None,
            labels: resource.basic.labels.clone(),
            texts,
            paragraphs,
            relations,
            modified: resource.basic.modified,
        };
        message.set_status(resource.basic.status);
        message
    }

    pub fn paragraph_count(&self) -> usize {
        self.paragraphs.len()
    }

    pub fn field_count(&self) -> usize {
        self.texts.len()
    }

    /// Replace the status label. Exactly one `/n/s/*` label remains.
    pub fn set_status(&mut self, status: ResourceStatus) {
        self.labels
            .retain(|label| !label.starts_with(STATUS_LABEL_PREFIX));
        self.labels.push(status.label().to_string());
    }

    pub fn status_labels(&self) -> impl Iterator<Item = &str> {
        self.labels
            .iter()
            .map(String::as_str)
            .filter(|label| label.starts_with(STATUS_LABEL_PREFIX))
    }

    pub fn check_indexable(&self, max_paragraphs: usize) -> Result<()> {
        if self.paragraph_count() > max_paragraphs {
            return Err(CoordError::ResourceNotIndexable(format!(
                "{} paragraphs exceeds the limit of {}",
                self.paragraph_count(),
                max_paragraphs
            )));
        }
        Ok(())
    }

    /// Drop the largest fields until the paragraph count fits. Returns the
    /// fields that were left out of the index.
    pub fn shed_fields(&mut self, max_paragraphs: usize) -> Vec<String> {
        let mut per_field: BTreeMap<String, usize> = BTreeMap::new();
        for paragraph in &self.paragraphs {
            *per_field.entry(paragraph.field.clone()).or_default() += 1;
        }
        let mut by_size: Vec<(String, usize)> = per_field.into_iter().collect();
        by_size.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut total = self.paragraph_count();
        let mut dropped = Vec::new();
        for (field, count) in by_size {
            if total <= max_paragraphs {
                break;
            }
            total -= count;
            dropped.push(field);
        }
        self.paragraphs
            .retain(|paragraph| !dropped.contains(&paragraph.field));
        self.texts.retain(|field, _| !dropped.contains(field));
        dropped
    }
}

fn split_paragraphs(field: &str, text: &str, vectors: &[Vec<f32>]) -> Vec<IndexParagraph> {
    let mut paragraphs = Vec::new();
    let mut offset = 0;
    for line in text.split('\n') {
        let start = offset;
        offset += line.len() + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let index = paragraphs.len();
        paragraphs.push(IndexParagraph {
            field: field.to_string(),
            index,
            text: trimmed.to_string(),
            start,
            end: start + line.len(),
            vector: vectors.get(index).cloned(),
        });
    }
    paragraphs
}

/// Field key as used inside an index message.
pub fn field_key(id: &FieldId) -> String {
    id.to_string()
}
