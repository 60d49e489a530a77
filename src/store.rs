use crate::workload::{ResourceKey, ResourceType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),
    #[error("image not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, InventoryError>;

// Only non-deleted rows take part in the identity tuple; the upsert conflict target
// must name the same partial index.
static SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS images (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    repository  TEXT NOT NULL,
    full_name   TEXT NOT NULL UNIQUE
);
CREATE INDEX IF NOT EXISTS idx_images_name ON images(name);

CREATE TABLE IF NOT EXISTS image_tag_records (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    image_id        INTEGER NOT NULL REFERENCES images(id),
    tag             TEXT NOT NULL,
    resource_type   TEXT NOT NULL,
    resource_name   TEXT NOT NULL,
    namespace       TEXT NOT NULL,
    container_name  TEXT NOT NULL,
    first_seen      INTEGER NOT NULL,
    last_seen       INTEGER NOT NULL,
    deleted_at      INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_image_tag_records_identity
    ON image_tag_records(image_id, tag, resource_type, resource_name, namespace, container_name)
    WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_image_tag_records_resource
    ON image_tag_records(resource_type, resource_name, namespace);
CREATE INDEX IF NOT EXISTS idx_image_tag_records_image
    ON image_tag_records(image_id, first_seen);
";

static RECORD_COLUMNS: &str = "
    r.id, i.name, i.repository, r.tag, r.resource_type, r.resource_name, r.namespace,
    r.container_name, r.first_seen, r.last_seen, r.deleted_at";

impl ToSql for ResourceType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ResourceType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// One observation of an image tag in a container, as handed to the store.
#[derive(Debug, Clone)]
pub struct TagObservation<'a> {
    pub image_name: &'a str,
    pub repository: &'a str,
    pub tag: &'a str,
    pub resource: &'a ResourceKey,
    pub container_name: &'a str,
    pub seen_at: DateTime<Utc>,
}

impl TagObservation<'_> {
    fn full_name(&self) -> String {
        format!("{}/{}", self.repository, self.image_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    pub id: i64,
    pub image_name: String,
    pub repository: String,
    pub tag: String,
    pub resource_type: ResourceType,
    pub resource_name: String,
    pub namespace: String,
    pub container_name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TagRecord {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey {
            resource_type: self.resource_type,
            name: self.resource_name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            image_name: row.get(1)?,
            repository: row.get(2)?,
            tag: row.get(3)?,
            resource_type: row.get(4)?,
            resource_name: row.get(5)?,
            namespace: row.get(6)?,
            container_name: row.get(7)?,
            first_seen: timestamp(8, row.get(8)?)?,
            last_seen: timestamp(9, row.get(9)?)?,
            deleted_at: row
                .get::<_, Option<i64>>(10)?
                .map(|micros| timestamp(10, micros))
                .transpose()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRow {
    pub id: i64,
    pub name: String,
    pub repository: String,
}

fn timestamp(idx: usize, micros: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, micros))
}

/// System of record for images and their observed tag records.
pub struct InventoryStore {
    conn: Mutex<Connection>,
}

impl InventoryStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening inventory database {}", path.as_ref().display());
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        debug!("Inventory schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Records that `observation` is currently present.
    ///
    /// Creates the image on first sight, inserts a fresh tag record when no live record
    /// exists for the identity tuple, and otherwise only moves `last_seen` forward.
    pub fn upsert_tag(&self, observation: &TagObservation<'_>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        Self::upsert_tag_tx(&tx, observation)?;
        tx.commit()?;
        Ok(())
    }

    /// Upserts `observation` and soft-deletes every other live record of the same
    /// container of the same resource, in one transaction.
    pub fn supersede_tag(&self, observation: &TagObservation<'_>) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let image_id = Self::upsert_tag_tx(&tx, observation)?;
        let retired = tx.execute(
            "UPDATE image_tag_records SET deleted_at = ?1
             WHERE deleted_at IS NULL
               AND resource_type = ?2 AND resource_name = ?3 AND namespace = ?4
               AND container_name = ?5
               AND NOT (image_id = ?6 AND tag = ?7)",
            params![
                observation.seen_at.timestamp_micros(),
                observation.resource.resource_type,
                observation.resource.name,
                observation.resource.namespace,
                observation.container_name,
                image_id,
                observation.tag,
            ],
        )?;
        tx.commit()?;
        Ok(retired)
    }

    fn upsert_tag_tx(tx: &Transaction<'_>, observation: &TagObservation<'_>) -> Result<i64> {
        let image_id: i64 = tx.query_row(
            "INSERT INTO images (name, repository, full_name) VALUES (?1, ?2, ?3)
             ON CONFLICT(full_name) DO UPDATE SET full_name = excluded.full_name
             RETURNING id",
            params![
                observation.image_name,
                observation.repository,
                observation.full_name()
            ],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO image_tag_records
                (image_id, tag, resource_type, resource_name, namespace, container_name,
                 first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(image_id, tag, resource_type, resource_name, namespace, container_name)
                WHERE deleted_at IS NULL
             DO UPDATE SET last_seen = MAX(last_seen, excluded.last_seen)",
            params![
                image_id,
                observation.tag,
                observation.resource.resource_type,
                observation.resource.name,
                observation.resource.namespace,
                observation.container_name,
                observation.seen_at.timestamp_micros(),
            ],
        )?;
        Ok(image_id)
    }

    /// Soft-deletes every live record of the resource. Returns the number of records touched.
    pub fn delete_tags(&self, resource: &ResourceKey, deleted_at: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "UPDATE image_tag_records SET deleted_at = ?1
             WHERE deleted_at IS NULL
               AND resource_type = ?2 AND resource_name = ?3 AND namespace = ?4",
            params![
                deleted_at.timestamp_micros(),
                resource.resource_type,
                resource.name,
                resource.namespace
            ],
        )?;
        Ok(deleted)
    }

    /// Soft-deletes every live record of one container of the resource.
    pub fn retire_container(
        &self,
        resource: &ResourceKey,
        container_name: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.conn.lock();
        let retired = conn.execute(
            "UPDATE image_tag_records SET deleted_at = ?1
             WHERE deleted_at IS NULL
               AND resource_type = ?2 AND resource_name = ?3 AND namespace = ?4
               AND container_name = ?5",
            params![
                deleted_at.timestamp_micros(),
                resource.resource_type,
                resource.name,
                resource.namespace,
                container_name
            ],
        )?;
        Ok(retired)
    }

    /// Live records, optionally restricted to one namespace.
    pub fn active_records(&self, namespace: Option<&str>) -> Result<Vec<TagRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS}
             FROM image_tag_records r JOIN images i ON i.id = r.image_id
             WHERE r.deleted_at IS NULL AND (?1 IS NULL OR r.namespace = ?1)
             ORDER BY r.id"
        ))?;
        let records = stmt
            .query_map(params![namespace], TagRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Live records of one workload kind across all namespaces.
    pub fn active_records_of_kind(&self, resource_type: ResourceType) -> Result<Vec<TagRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS}
             FROM image_tag_records r JOIN images i ON i.id = r.image_id
             WHERE r.deleted_at IS NULL AND r.resource_type = ?1
             ORDER BY r.id"
        ))?;
        let records = stmt
            .query_map(params![resource_type], TagRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// First image with the given short name, by creation order.
    pub fn find_image_by_name(&self, name: &str) -> Result<Option<ImageRow>> {
        let conn = self.conn.lock();
        let image = conn
            .query_row(
                "SELECT id, name, repository FROM images
                 WHERE name = ?1 ORDER BY id LIMIT 1",
                params![name],
                |row| {
                    Ok(ImageRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        repository: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(image)
    }

    /// All records of an image, soft-deleted ones included, newest `first_seen` first.
    pub fn image_records(&self, image_id: i64, namespace: Option<&str>) -> Result<Vec<TagRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS}
             FROM image_tag_records r JOIN images i ON i.id = r.image_id
             WHERE r.image_id = ?1 AND (?2 IS NULL OR r.namespace = ?2)
             ORDER BY r.first_seen DESC, r.id DESC"
        ))?;
        let records = stmt
            .query_map(params![image_id, namespace], TagRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn deployment(name: &str) -> ResourceKey {
        ResourceKey {
            resource_type: ResourceType::Deployment,
            name: name.to_string(),
            namespace: "default".to_string(),
        }
    }

    fn observation<'a>(
        resource: &'a ResourceKey,
        container: &'a str,
        tag: &'a str,
        seen_at: DateTime<Utc>,
    ) -> TagObservation<'a> {
        TagObservation {
            image_name: "nginx",
            repository: "docker.io",
            tag,
            resource,
            container_name: container,
            seen_at,
        }
    }

    #[test]
    fn test_upsert_is_idempotent_and_keeps_first_seen() {
        let store = InventoryStore::open_in_memory().unwrap();
        let web = deployment("web");

        store.upsert_tag(&observation(&web, "nginx", "1.19", at(0))).unwrap();
        store.upsert_tag(&observation(&web, "nginx", "1.19", at(10))).unwrap();

        let records = store.active_records(None).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].first_seen, at(0));
        assert_eq!(records[0].last_seen, at(10));
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let store = InventoryStore::open_in_memory().unwrap();
        let web = deployment("web");

        store.upsert_tag(&observation(&web, "nginx", "1.19", at(10))).unwrap();
        store.upsert_tag(&observation(&web, "nginx", "1.19", at(5))).unwrap();

        let records = store.active_records(None).unwrap();
        assert_eq!(records[0].first_seen, at(10));
        assert_eq!(records[0].last_seen, at(10));
    }

    #[test]
    fn test_image_is_created_once_per_full_name() {
        let store = InventoryStore::open_in_memory().unwrap();
        store
            .upsert_tag(&observation(&deployment("a"), "nginx", "1.19", at(0)))
            .unwrap();
        store
            .upsert_tag(&observation(&deployment("b"), "nginx", "1.20", at(1)))
            .unwrap();

        let count: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.active_records(None).unwrap().len(), 2);
    }

    #[test]
    fn test_delete_tags_is_resource_scoped() {
        let store = InventoryStore::open_in_memory().unwrap();
        let web = deployment("web");
        let api = deployment("api");
        store.upsert_tag(&observation(&web, "nginx", "1.19", at(0))).unwrap();
        store.upsert_tag(&observation(&web, "sidecar", "1.19", at(0))).unwrap();
        store.upsert_tag(&observation(&api, "nginx", "1.19", at(0))).unwrap();

        assert_eq!(store.delete_tags(&web, at(5)).unwrap(), 2);

        let active = store.active_records(None).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].resource_name, "api");
    }

    #[test]
    fn test_delete_unknown_resource_is_noop() {
        let store = InventoryStore::open_in_memory().unwrap();
        assert_eq!(store.delete_tags(&deployment("ghost"), at(0)).unwrap(), 0);
    }

    #[test]
    fn test_reobservation_after_delete_inserts_new_row() {
        let store = InventoryStore::open_in_memory().unwrap();
        let web = deployment("web");
        store.upsert_tag(&observation(&web, "nginx", "1.19", at(0))).unwrap();
        store.delete_tags(&web, at(5)).unwrap();
        store.upsert_tag(&observation(&web, "nginx", "1.19", at(10))).unwrap();

        let image = store.find_image_by_name("nginx").unwrap().unwrap();
        let history = store.image_records(image.id, None).unwrap();
        assert_eq!(history.len(), 2);
        // newest first_seen first
        assert!(history[0].is_active());
        assert_eq!(history[0].first_seen, at(10));
        assert_eq!(history[1].deleted_at, Some(at(5)));
        assert_eq!(history[1].first_seen, at(0));
    }

    #[test]
    fn test_supersede_retires_previous_tag_of_container() {
        let store = InventoryStore::open_in_memory().unwrap();
        let web = deployment("web");
        store.upsert_tag(&observation(&web, "nginx", "1.19", at(0))).unwrap();
        store.upsert_tag(&observation(&web, "other", "1.19", at(0))).unwrap();

        let retired = store
            .supersede_tag(&observation(&web, "nginx", "1.20", at(5)))
            .unwrap();
        assert_eq!(retired, 1);

        let active = store.active_records(None).unwrap();
        let tags: Vec<(&str, &str)> = active
            .iter()
            .map(|r| (r.container_name.as_str(), r.tag.as_str()))
            .collect();
        assert_eq!(tags, vec![("other", "1.19"), ("nginx", "1.20")]);
    }

    #[test]
    fn test_supersede_same_tag_only_refreshes() {
        let store = InventoryStore::open_in_memory().unwrap();
        let web = deployment("web");
        store.upsert_tag(&observation(&web, "nginx", "1.19", at(0))).unwrap();

        let retired = store
            .supersede_tag(&observation(&web, "nginx", "1.19", at(5)))
            .unwrap();

        assert_eq!(retired, 0);
        let active = store.active_records(None).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].last_seen, at(5));
    }

    #[test]
    fn test_retire_container() {
        let store = InventoryStore::open_in_memory().unwrap();
        let web = deployment("web");
        store.upsert_tag(&observation(&web, "nginx", "1.19", at(0))).unwrap();
        store.upsert_tag(&observation(&web, "sidecar", "1.19", at(0))).unwrap();

        assert_eq!(store.retire_container(&web, "sidecar", at(3)).unwrap(), 1);

        let active = store.active_records(None).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].container_name, "nginx");
    }

    #[test]
    fn test_active_records_of_kind() {
        let store = InventoryStore::open_in_memory().unwrap();
        let web = deployment("web");
        let proxy = ResourceKey {
            resource_type: ResourceType::DaemonSet,
            name: "proxy".to_string(),
            namespace: "kube-system".to_string(),
        };
        store.upsert_tag(&observation(&web, "nginx", "1.19", at(0))).unwrap();
        store.upsert_tag(&observation(&proxy, "proxy", "1.29", at(0))).unwrap();
        store.delete_tags(&web, at(1)).unwrap();

        assert!(store.active_records_of_kind(ResourceType::Deployment).unwrap().is_empty());
        let daemons = store.active_records_of_kind(ResourceType::DaemonSet).unwrap();
        assert_eq!(daemons.len(), 1);
        assert_eq!(daemons[0].resource_key(), proxy);
    }

    #[test]
    fn test_active_records_namespace_filter() {
        let store = InventoryStore::open_in_memory().unwrap();
        let mut other = deployment("web");
        other.namespace = "staging".to_string();
        store
            .upsert_tag(&observation(&deployment("web"), "nginx", "1.19", at(0)))
            .unwrap();
        store.upsert_tag(&observation(&other, "nginx", "1.19", at(0))).unwrap();

        assert_eq!(store.active_records(Some("staging")).unwrap().len(), 1);
        assert_eq!(store.active_records(None).unwrap().len(), 2);
        assert!(store.active_records(Some("nowhere")).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_upserts_of_distinct_resources() {
        let store = Arc::new(InventoryStore::open_in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    let resource = deployment(&format!("web-{}", i));
                    for round in 0..5 {
                        store
                            .upsert_tag(&observation(&resource, "nginx", "1.19", at(round)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let records = store.active_records(None).unwrap();
        assert_eq!(records.len(), 8);
        assert!(records.iter().all(|r| r.first_seen == at(0) && r.last_seen == at(4)));
    }

    #[test]
    fn test_open_on_disk_persists_between_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.db");
        {
            let store = InventoryStore::open(&path).unwrap();
            store
                .upsert_tag(&observation(&deployment("web"), "nginx", "1.19", at(0)))
                .unwrap();
        }
        let store = InventoryStore::open(&path).unwrap();
        assert_eq!(store.active_records(None).unwrap().len(), 1);
    }
}
