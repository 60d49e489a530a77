use std::fmt;

static DEFAULT_REGISTRY: &str = "docker.io";
static DEFAULT_TAG: &str = "latest";

/// Structured identity of a container image reference as it is stored in the inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageReference {
    pub name: String,
    pub tag: String,
    pub repository: String,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.tag)
    }
}

impl ImageReference {
    /// Splits a raw image reference into name, tag and repository.
    ///
    /// Never fails: anything that does not look like a well-formed reference is kept as
    /// best-effort data. Only a single `:` is treated as a tag separator, so references
    /// with a registry port (`host:5000/app:v1`) keep the default tag and the whole
    /// string up to the first `:` as their path.
    pub fn parse(s: &str) -> Self {
        let mut parts = s.split(':');
        let path = parts.next().unwrap_or_default();
        let tag = match (parts.next(), parts.next()) {
            (Some(tag), None) => tag.to_string(),
            _ => DEFAULT_TAG.to_string(),
        };

        let segments: Vec<&str> = path.split('/').collect();
        let (repository, name) = match segments.as_slice() {
            [name] => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            [first, name] if first.contains('.') => (first.to_string(), name.to_string()),
            [namespace, name] => (format!("{}/{}", DEFAULT_REGISTRY, namespace), name.to_string()),
            [prefix @ .., name] => (prefix.join("/"), name.to_string()),
            [] => (DEFAULT_REGISTRY.to_string(), String::new()),
        };

        Self {
            name,
            tag,
            repository,
        }
    }
}
