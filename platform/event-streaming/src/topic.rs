use serde::{Deserialize, Serialize};

use crate::error::StreamingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerializationFormat {
    #[default]
    Json,
}

fn default_partitions() -> u32 {
    1
}

fn default_replication() -> u16 {
    1
}

fn default_retention() -> u32 {
    168
}

/// Topic definition registered with the system
///
/// Partitioning and retention belong to the broker; these fields describe
/// the intended layout and are reported in system status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamTopic {
    pub name: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_replication")]
    pub replication_factor: u16,
    #[serde(default = "default_retention")]
    pub retention_hours: u32,
    #[serde(default)]
    pub format: SerializationFormat,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl StreamTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: default_partitions(),
            replication_factor: default_replication(),
            retention_hours: default_retention(),
            format: SerializationFormat::default(),
            tags: Vec::new(),
        }
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_retention_hours(mut self, hours: u32) -> Self {
        self.retention_hours = hours;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Parse a JSON array of topics
    pub fn list_from_json(json: &str) -> StreamingResult<Vec<StreamTopic>> {
        Ok(serde_json::from_str(json)?)
    }
}
