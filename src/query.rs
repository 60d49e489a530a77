use crate::store::{InventoryError, InventoryStore, Result, TagRecord};
use crate::workload::ResourceType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// The tag a workload is currently running for one image, with every container using it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryRow {
    pub name: String,
    pub repository: String,
    pub tag: String,
    #[serde(rename = "resourceType")]
    pub resource_type: ResourceType,
    #[serde(rename = "resourceName")]
    pub resource_name: String,
    pub namespace: String,
    pub containers: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagHistoryEntry {
    pub tag: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub resource_type: ResourceType,
    pub resource_name: String,
    pub namespace: String,
    pub container: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagHistory {
    pub image_name: String,
    pub repository: String,
    pub tags: Vec<TagHistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct WorkloadImage<'a> {
    image_name: &'a str,
    resource_type: ResourceType,
    resource_name: &'a str,
    namespace: &'a str,
}

impl<'a> From<&'a TagRecord> for WorkloadImage<'a> {
    fn from(record: &'a TagRecord) -> Self {
        Self {
            image_name: &record.image_name,
            resource_type: record.resource_type,
            resource_name: &record.resource_name,
            namespace: &record.namespace,
        }
    }
}

/// Read side of the inventory.
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<InventoryStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<InventoryStore>) -> Self {
        Self { store }
    }

    /// One row per image and workload, showing the most recently seen tag only.
    pub fn list_current_inventory(&self, namespace: Option<&str>) -> Result<Vec<InventoryRow>> {
        let records = self.store.active_records(namespace)?;

        let mut groups: BTreeMap<WorkloadImage<'_>, Vec<&TagRecord>> = BTreeMap::new();
        for record in &records {
            groups.entry(record.into()).or_default().push(record);
        }

        let rows = groups
            .into_values()
            .filter_map(|group| {
                // Records arrive in id order, so the first maximum wins ties
                let latest = group.iter().copied().reduce(|best, candidate| {
                    if candidate.last_seen > best.last_seen {
                        candidate
                    } else {
                        best
                    }
                })?;
                let current: Vec<&TagRecord> = group
                    .into_iter()
                    .filter(|r| r.tag == latest.tag)
                    .collect();

                Some(InventoryRow {
                    name: latest.image_name.clone(),
                    repository: latest.repository.clone(),
                    tag: latest.tag.clone(),
                    resource_type: latest.resource_type,
                    resource_name: latest.resource_name.clone(),
                    namespace: latest.namespace.clone(),
                    containers: current.iter().map(|r| r.container_name.clone()).collect(),
                    first_seen: current.iter().map(|r| r.first_seen).min()?,
                    last_seen: current.iter().map(|r| r.last_seen).max()?,
                })
            })
            .collect();

        Ok(rows)
    }

    /// Every recorded occurrence of an image, including soft-deleted ones.
    ///
    /// A tag is active when any live record carries it within the queried scope.
    pub fn get_tag_history(&self, image_name: &str, namespace: Option<&str>) -> Result<TagHistory> {
        let image = self
            .store
            .find_image_by_name(image_name)?
            .ok_or_else(|| InventoryError::NotFound(image_name.to_string()))?;

        let records = self.store.image_records(image.id, namespace)?;
        let active_tags: HashSet<&str> = records
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.tag.as_str())
            .collect();

        let tags = records
            .iter()
            .map(|r| TagHistoryEntry {
                tag: r.tag.clone(),
                first_seen: r.first_seen,
                last_seen: r.last_seen,
                resource_type: r.resource_type,
                resource_name: r.resource_name.clone(),
                namespace: r.namespace.clone(),
                container: r.container_name.clone(),
                active: active_tags.contains(r.tag.as_str()),
                deleted_at: r.deleted_at,
            })
            .collect();

        Ok(TagHistory {
            image_name: image.name,
            repository: image.repository,
            tags,
        })
    }
}
