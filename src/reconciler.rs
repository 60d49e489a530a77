use crate::events::{EventEmitter, ImageEvent, ImageEventKind, Trigger};
use crate::image_reference::ImageReference;
use crate::store::{InventoryStore, Result, TagObservation};
use crate::workload::{PodTemplate, ResourceKey, ResourceType};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info};

/// Applies image events to the inventory store.
///
/// Store failures are logged and dropped: the watch mechanism redelivers superseding
/// events, so one failed write must never hold up the next.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<InventoryStore>,
}

impl Reconciler {
    pub fn new(store: Arc<InventoryStore>) -> Self {
        Self { store }
    }

    pub fn apply_all(&self, events: &[ImageEvent]) {
        for event in events {
            self.apply(event);
        }
    }

    /// Brings the store in line with a complete listing of one workload kind.
    ///
    /// Listed containers are applied as UPDATE, superseding whatever tag the store still
    /// holds for them. Live records of the kind in admitted namespaces that the listing
    /// no longer accounts for are then soft-deleted: the whole resource when it is not
    /// listed, single containers when the listed template lacks them.
    pub fn apply_listing(
        &self,
        resource_type: ResourceType,
        listing: &[(ResourceKey, PodTemplate)],
        emitter: &EventEmitter,
        observed_at: DateTime<Utc>,
    ) {
        let events: Vec<ImageEvent> = listing
            .iter()
            .flat_map(|(key, template)| {
                emitter.emit_at(key, &Trigger::Listed(template.clone()), observed_at)
            })
            .collect();
        self.apply_all(&events);

        match self.stale_events(resource_type, listing, emitter, observed_at) {
            Ok(stale) => {
                if !stale.is_empty() {
                    info!(
                        "Retiring {} {} records missing from the listing",
                        stale.len(),
                        resource_type
                    );
                }
                self.apply_all(&stale);
            }
            Err(e) => error!("Failed to read live {} records: {}", resource_type, e),
        }
    }

    fn stale_events(
        &self,
        resource_type: ResourceType,
        listing: &[(ResourceKey, PodTemplate)],
        emitter: &EventEmitter,
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<ImageEvent>> {
        let listed: HashMap<&ResourceKey, &PodTemplate> =
            listing.iter().map(|(key, template)| (key, template)).collect();
        let mut deleted: HashSet<ResourceKey> = HashSet::new();
        let mut retired: HashSet<(ResourceKey, String)> = HashSet::new();
        let mut events = Vec::new();

        for record in self.store.active_records_of_kind(resource_type)? {
            if !emitter.admits(&record.namespace) {
                continue;
            }
            let resource = record.resource_key();
            let kind = match listed.get(&resource) {
                None if deleted.insert(resource.clone()) => ImageEventKind::Delete,
                Some(template)
                    if template.find(&record.container_name).is_none()
                        && retired.insert((resource.clone(), record.container_name.clone())) =>
                {
                    ImageEventKind::Retire
                }
                _ => continue,
            };
            events.push(ImageEvent {
                kind,
                resource,
                container_name: record.container_name,
                image: ImageReference {
                    name: record.image_name,
                    tag: record.tag,
                    repository: record.repository,
                },
                observed_at,
            });
        }
        Ok(events)
    }

    pub fn apply(&self, event: &ImageEvent) {
        info!(
            kind = %event.kind,
            image = %event.image,
            resource_type = %event.resource.resource_type,
            resource_name = %event.resource.name,
            namespace = %event.resource.namespace,
            container = %event.container_name,
            "Reconciling image event"
        );

        let observation = TagObservation {
            image_name: &event.image.name,
            repository: &event.image.repository,
            tag: &event.image.tag,
            resource: &event.resource,
            container_name: &event.container_name,
            seen_at: event.observed_at,
        };

        let outcome = match event.kind {
            ImageEventKind::Add => self.store.upsert_tag(&observation).map(|_| 0),
            ImageEventKind::Update => self.store.supersede_tag(&observation),
            ImageEventKind::Delete => self
                .store
                .delete_tags(&event.resource, event.observed_at),
            ImageEventKind::Retire => self.store.retire_container(
                &event.resource,
                &event.container_name,
                event.observed_at,
            ),
        };

        if let Err(e) = outcome {
            error!(
                "Failed to apply {} event for {} container {}: {}",
                event.kind, event.resource, event.container_name, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DiffStrategy, NamespaceFilter};
    use crate::query::QueryEngine;
    use crate::store::InventoryError;
    use crate::workload::ContainerImage;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn template(containers: &[(&str, &str)]) -> PodTemplate {
        PodTemplate {
            containers: containers
                .iter()
                .map(|(name, image)| ContainerImage {
                    name: name.to_string(),
                    image: image.to_string(),
                })
                .collect(),
        }
    }

    fn web() -> ResourceKey {
        ResourceKey {
            resource_type: ResourceType::Deployment,
            name: "web".to_string(),
            namespace: "default".to_string(),
        }
    }

    fn setup(strategy: DiffStrategy) -> (EventEmitter, Reconciler, QueryEngine) {
        let store = Arc::new(InventoryStore::open_in_memory().unwrap());
        (
            EventEmitter::new(NamespaceFilter::all(), strategy),
            Reconciler::new(store.clone()),
            QueryEngine::new(store),
        )
    }

    #[test]
    fn test_add_then_delete_keeps_history() {
        let (emitter, reconciler, query) = setup(DiffStrategy::PerContainer);
        let spec = template(&[("nginx", "nginx:1.19")]);

        reconciler.apply_all(&emitter.emit_at(&web(), &Trigger::Created(spec.clone()), at(0)));

        let inventory = query.list_current_inventory(None).unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].name, "nginx");
        assert_eq!(inventory[0].tag, "1.19");
        assert_eq!(inventory[0].containers, vec!["nginx"]);

        reconciler.apply_all(&emitter.emit_at(&web(), &Trigger::Removed(spec), at(10)));

        assert!(query.list_current_inventory(None).unwrap().is_empty());
        let history = query.get_tag_history("nginx", None).unwrap();
        assert_eq!(history.tags.len(), 1);
        assert_eq!(history.tags[0].tag, "1.19");
        assert!(!history.tags[0].active);
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let (emitter, reconciler, query) = setup(DiffStrategy::PerContainer);
        let created = Trigger::Created(template(&[("nginx", "nginx:1.19")]));

        reconciler.apply_all(&emitter.emit_at(&web(), &created, at(0)));
        reconciler.apply_all(&emitter.emit_at(&web(), &created, at(30)));

        let inventory = query.list_current_inventory(None).unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].first_seen, at(0));
        assert_eq!(inventory[0].last_seen, at(30));
    }

    #[test]
    fn test_update_supersedes_previous_tag() {
        let (emitter, reconciler, query) = setup(DiffStrategy::PerContainer);
        let v1 = template(&[("app", "registry.example.com/team/app:v1")]);
        let v2 = template(&[("app", "registry.example.com/team/app:v2")]);

        reconciler.apply_all(&emitter.emit_at(&web(), &Trigger::Created(v1.clone()), at(0)));
        reconciler.apply_all(&emitter.emit_at(
            &web(),
            &Trigger::Modified { old: v1, new: v2 },
            at(10),
        ));

        let inventory = query.list_current_inventory(None).unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].tag, "v2");

        let history = query.get_tag_history("app", None).unwrap();
        let tags: Vec<(&str, bool)> = history
            .tags
            .iter()
            .map(|t| (t.tag.as_str(), t.active))
            .collect();
        assert_eq!(tags, vec![("v2", true), ("v1", false)]);
    }

    #[test]
    fn test_whole_spec_update_reemits_and_supersedes() {
        let (emitter, reconciler, query) = setup(DiffStrategy::WholeSpec);
        let v1 = template(&[("app", "app:v1")]);
        let v2 = template(&[("app", "app:v2")]);

        reconciler.apply_all(&emitter.emit_at(&web(), &Trigger::Created(v1.clone()), at(0)));
        reconciler.apply_all(&emitter.emit_at(
            &web(),
            &Trigger::Modified { old: v1, new: v2 },
            at(10),
        ));

        let inventory = query.list_current_inventory(None).unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].tag, "v2");
        let history = query.get_tag_history("app", None).unwrap();
        assert_eq!(history.tags.len(), 2);
        assert!(history.tags.iter().any(|t| t.tag == "v1" && !t.active));
    }

    #[test]
    fn test_removed_container_is_retired() {
        let (emitter, reconciler, query) = setup(DiffStrategy::PerContainer);
        let before = template(&[("app", "app:v1"), ("debug", "busybox:1.36")]);
        let after = template(&[("app", "app:v1")]);

        reconciler.apply_all(&emitter.emit_at(&web(), &Trigger::Created(before.clone()), at(0)));
        reconciler.apply_all(&emitter.emit_at(
            &web(),
            &Trigger::Modified {
                old: before,
                new: after,
            },
            at(5),
        ));

        let inventory = query.list_current_inventory(None).unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].name, "app");
        let history = query.get_tag_history("busybox", None).unwrap();
        assert!(!history.tags[0].active);
    }

    fn deployment(name: &str, namespace: &str) -> ResourceKey {
        ResourceKey {
            resource_type: ResourceType::Deployment,
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    #[test]
    fn test_listing_after_restart_supersedes_changed_image() {
        let (emitter, reconciler, query) = setup(DiffStrategy::PerContainer);
        reconciler.apply_all(&emitter.emit_at(
            &web(),
            &Trigger::Created(template(&[("app", "app:v1")])),
            at(0),
        ));

        // Image changed while nothing was watching; the next start only sees v2
        let listing = vec![(web(), template(&[("app", "app:v2")]))];
        reconciler.apply_listing(ResourceType::Deployment, &listing, &emitter, at(100));

        let history = query.get_tag_history("app", None).unwrap();
        let tags: Vec<(&str, bool)> = history
            .tags
            .iter()
            .map(|t| (t.tag.as_str(), t.active))
            .collect();
        assert_eq!(tags, vec![("v2", true), ("v1", false)]);
        assert_eq!(history.tags[1].deleted_at, Some(at(100)));
    }

    #[test]
    fn test_listing_deletes_unlisted_workloads_and_retires_containers() {
        let (emitter, reconciler, query) = setup(DiffStrategy::PerContainer);
        let api = deployment("api", "default");
        reconciler.apply_all(&emitter.emit_at(
            &web(),
            &Trigger::Created(template(&[("app", "app:v1"), ("debug", "busybox:1.36")])),
            at(0),
        ));
        reconciler.apply_all(&emitter.emit_at(
            &api,
            &Trigger::Created(template(&[("api", "api:v3")])),
            at(0),
        ));

        let listing = vec![(web(), template(&[("app", "app:v1")]))];
        reconciler.apply_listing(ResourceType::Deployment, &listing, &emitter, at(50));

        let inventory = query.list_current_inventory(None).unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].name, "app");
        assert_eq!(inventory[0].last_seen, at(50));
        assert!(!query.get_tag_history("busybox", None).unwrap().tags[0].active);
        assert!(!query.get_tag_history("api", None).unwrap().tags[0].active);
    }

    #[test]
    fn test_listing_leaves_other_kinds_and_foreign_namespaces_alone() {
        let store = Arc::new(InventoryStore::open_in_memory().unwrap());
        let reconciler = Reconciler::new(store.clone());
        let query = QueryEngine::new(store);
        let everything = EventEmitter::new(NamespaceFilter::all(), DiffStrategy::PerContainer);
        let proxy = ResourceKey {
            resource_type: ResourceType::DaemonSet,
            name: "proxy".to_string(),
            namespace: "default".to_string(),
        };
        let legacy = deployment("legacy", "kube-system");
        for (key, image) in [(&proxy, "proxy:1"), (&legacy, "legacy:1")] {
            reconciler.apply_all(&everything.emit_at(
                key,
                &Trigger::Created(template(&[("main", image)])),
                at(0),
            ));
        }

        let filter = NamespaceFilter::new(&["default".to_string()]).unwrap();
        let scoped = EventEmitter::new(filter, DiffStrategy::PerContainer);
        reconciler.apply_listing(ResourceType::Deployment, &[], &scoped, at(10));

        assert_eq!(query.list_current_inventory(None).unwrap().len(), 2);
    }

    #[test]
    fn test_removed_workload_without_containers_is_deleted() {
        let (emitter, reconciler, query) = setup(DiffStrategy::PerContainer);
        reconciler.apply_all(&emitter.emit_at(
            &web(),
            &Trigger::Created(template(&[("nginx", "nginx:1.19")])),
            at(0),
        ));

        reconciler.apply_all(&emitter.emit_at(
            &web(),
            &Trigger::Removed(PodTemplate::default()),
            at(10),
        ));

        assert!(query.list_current_inventory(None).unwrap().is_empty());
    }

    #[test]
    fn test_store_failure_is_swallowed() {
        let store = Arc::new(InventoryStore::open_in_memory().unwrap());
        let reconciler = Reconciler::new(store.clone());
        let emitter = EventEmitter::new(NamespaceFilter::all(), DiffStrategy::PerContainer);
        store.execute_raw("DROP TABLE image_tag_records").unwrap();

        reconciler.apply_all(&emitter.emit_at(
            &web(),
            &Trigger::Created(template(&[("nginx", "nginx:1.19")])),
            at(1),
        ));

        assert!(matches!(
            store.active_records(None),
            Err(InventoryError::Persistence(_))
        ));
    }
}
