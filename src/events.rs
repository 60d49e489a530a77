use crate::image_reference::ImageReference;
use crate::workload::{PodTemplate, ResourceKey};
use anyhow::Context;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageEventKind {
    Add,
    Update,
    /// Resource-scoped removal: every container of the resource goes away.
    Delete,
    /// Container-scoped removal within a resource that still exists.
    Retire,
}

impl fmt::Display for ImageEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageEventKind::Add => "ADD",
            ImageEventKind::Update => "UPDATE",
            ImageEventKind::Delete => "DELETE",
            ImageEventKind::Retire => "RETIRE",
        };
        f.write_str(s)
    }
}

/// A single image lifecycle event for one container of one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEvent {
    pub kind: ImageEventKind,
    pub resource: ResourceKey,
    pub container_name: String,
    pub image: ImageReference,
    pub observed_at: DateTime<Utc>,
}

impl ImageEvent {
    /// DELETE for a resource whose template carried no containers at removal time.
    fn resource_removed(resource: &ResourceKey, observed_at: DateTime<Utc>) -> Self {
        Self {
            kind: ImageEventKind::Delete,
            resource: resource.clone(),
            container_name: String::new(),
            image: ImageReference::default(),
            observed_at,
        }
    }
}

/// Resource-level change delivered by the watch mechanism.
#[derive(Debug, Clone)]
pub enum Trigger {
    Created(PodTemplate),
    Modified { old: PodTemplate, new: PodTemplate },
    Removed(PodTemplate),
    /// Present in a complete listing, with no previously known template to diff against.
    Listed(PodTemplate),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiffStrategy {
    /// Compare containers by name and emit events only for the ones that changed.
    #[default]
    PerContainer,
    /// Re-emit UPDATE for every container whenever the ordered image list differs.
    WholeSpec,
}

/// Namespace allow-list. Entries may be glob patterns; an empty list or `*` admits everything.
#[derive(Debug, Clone)]
pub struct NamespaceFilter {
    patterns: Option<GlobSet>,
}

impl NamespaceFilter {
    pub fn new(namespaces: &[String]) -> anyhow::Result<Self> {
        if namespaces.is_empty() || namespaces.iter().any(|ns| ns == "*") {
            return Ok(Self::all());
        }

        let mut builder = GlobSetBuilder::new();
        for namespace in namespaces {
            let glob = Glob::new(namespace)
                .with_context(|| format!("Invalid namespace pattern {}", namespace))?;
            builder.add(glob);
        }
        let patterns = builder
            .build()
            .context("Failed to build namespace filter")?;

        Ok(Self {
            patterns: Some(patterns),
        })
    }

    pub fn all() -> Self {
        Self { patterns: None }
    }

    pub fn allows(&self, namespace: &str) -> bool {
        match &self.patterns {
            None => true,
            Some(patterns) => patterns.is_match(namespace),
        }
    }
}

/// Turns resource-level triggers into per-container image events.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    filter: NamespaceFilter,
    strategy: DiffStrategy,
}

impl EventEmitter {
    pub fn new(filter: NamespaceFilter, strategy: DiffStrategy) -> Self {
        Self { filter, strategy }
    }

    pub fn admits(&self, namespace: &str) -> bool {
        self.filter.allows(namespace)
    }

    pub fn emit(&self, resource: &ResourceKey, trigger: &Trigger) -> Vec<ImageEvent> {
        self.emit_at(resource, trigger, Utc::now())
    }

    pub fn emit_at(
        &self,
        resource: &ResourceKey,
        trigger: &Trigger,
        observed_at: DateTime<Utc>,
    ) -> Vec<ImageEvent> {
        let event = |kind: ImageEventKind, container_name: &str, image: &str| ImageEvent {
            kind,
            resource: resource.clone(),
            container_name: container_name.to_string(),
            image: ImageReference::parse(image),
            observed_at,
        };

        let mut events: Vec<ImageEvent> = match trigger {
            Trigger::Created(template) => template
                .containers
                .iter()
                .map(|c| event(ImageEventKind::Add, &c.name, &c.image))
                .collect(),
            Trigger::Removed(template) if template.containers.is_empty() => {
                vec![ImageEvent::resource_removed(resource, observed_at)]
            }
            Trigger::Removed(template) => template
                .containers
                .iter()
                .map(|c| event(ImageEventKind::Delete, &c.name, &c.image))
                .collect(),
            Trigger::Listed(template) => template
                .containers
                .iter()
                .map(|c| event(ImageEventKind::Update, &c.name, &c.image))
                .collect(),
            Trigger::Modified { old, new } => match self.strategy {
                DiffStrategy::WholeSpec => {
                    if old.images() == new.images() {
                        Vec::new()
                    } else {
                        new.containers
                            .iter()
                            .map(|c| event(ImageEventKind::Update, &c.name, &c.image))
                            .collect()
                    }
                }
                DiffStrategy::PerContainer => {
                    let mut events = Vec::new();
                    for container in &new.containers {
                        match old.find(&container.name) {
                            None => events.push(event(
                                ImageEventKind::Add,
                                &container.name,
                                &container.image,
                            )),
                            Some(previous) if previous.image != container.image => events.push(
                                event(ImageEventKind::Update, &container.name, &container.image),
                            ),
                            Some(_) => {}
                        }
                    }
                    let remaining: HashSet<&str> =
                        new.containers.iter().map(|c| c.name.as_str()).collect();
                    for container in &old.containers {
                        if !remaining.contains(container.name.as_str()) {
                            events.push(event(
                                ImageEventKind::Retire,
                                &container.name,
                                &container.image,
                            ));
                        }
                    }
                    events
                }
            },
        };

        events.retain(|e| self.filter.allows(&e.resource.namespace));
        events
    }
}
