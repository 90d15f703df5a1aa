//! Step-level artifact caching.
//!
//! A step declares a [`CachePolicy`]; together with the step's logical output
//! path it forms a [`CacheDescriptor`]. The [`CacheResolver`] renders the
//! descriptor into a concrete [`Location`], decides whether a prior artifact
//! exists there (downloading remote hits into scratch space), and stores fresh
//! output after a miss.
//!
//! Lookups never fail because an entry is absent: absence simply means the
//! step executes. Persistence failures are reported as [`CacheError`] and are
//! never fatal to the run.

use crate::definition::CachePolicy;
use crate::errors::{CacheError, ConfigurationError, ExpflowResult};
use crate::storage::{fs, upload_tree, Location, ObjectStore};
use dashmap::DashMap;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

/// Layout used by [`CachePolicy::DefaultLocation`].
pub const DEFAULT_TEMPLATE: &str =
    "{cacheRoot}/{hyperparameterSlug}/{definitionHash}/{parameterVersion}/{logicalPath}";

#[allow(clippy::expect_used)]
static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("valid placeholder pattern"));

/// Cache settings of one step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheDescriptor {
    /// Materialization policy.
    pub policy: CachePolicy,
    /// Step output path relative to the node, e.g. `predict-parameters.zip`.
    pub logical_path: String,
}

impl CacheDescriptor {
    /// Creates a descriptor.
    #[must_use]
    pub fn new(policy: CachePolicy, logical_path: impl Into<String>) -> Self {
        Self {
            policy,
            logical_path: logical_path.into(),
        }
    }
}

/// What identifies cached content beyond the step itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheIdentity {
    /// Hyperparameter slug of the algorithm.
    pub hyperparameter_slug: String,
    /// Parameter version of the node.
    pub parameter_version: String,
    /// Content hash of the resolved definition.
    pub definition_hash: String,
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// The step has no cache policy.
    Disabled,
    /// A prior artifact exists; `local` is where it can be read.
    Hit {
        /// Rendered cache location.
        location: Location,
        /// Local copy of the artifact.
        local: PathBuf,
    },
    /// Nothing cached yet; output should be persisted to `location`.
    Miss {
        /// Rendered cache location.
        location: Location,
    },
}

type RenderKey = (CacheDescriptor, CacheIdentity);

/// Resolves, materializes and persists cache entries for one run.
pub struct CacheResolver {
    cache_root: Option<String>,
    scratch: PathBuf,
    store: Option<Arc<dyn ObjectStore>>,
    rendered: DashMap<RenderKey, Location>,
    materialized: DashMap<Location, PathBuf>,
}

impl std::fmt::Debug for CacheResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheResolver")
            .field("cache_root", &self.cache_root)
            .field("scratch", &self.scratch)
            .field("has_store", &self.store.is_some())
            .field("rendered", &self.rendered.len())
            .finish()
    }
}

impl CacheResolver {
    /// Creates a resolver downloading remote hits into `scratch`.
    #[must_use]
    pub fn new(cache_root: Option<String>, scratch: impl Into<PathBuf>) -> Self {
        Self {
            cache_root,
            scratch: scratch.into(),
            store: None,
            rendered: DashMap::new(),
            materialized: DashMap::new(),
        }
    }

    /// Sets the object store used for remote locations.
    #[must_use]
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Renders the location for `descriptor`, or `None` when caching is off.
    ///
    /// Repeated calls with the same inputs return the same location.
    pub fn resolve(
        &self,
        descriptor: &CacheDescriptor,
        identity: &CacheIdentity,
    ) -> Result<Option<Location>, ConfigurationError> {
        let template = match &descriptor.policy {
            CachePolicy::None => return Ok(None),
            CachePolicy::DefaultLocation => {
                if self.cache_root.is_none() {
                    return Err(ConfigurationError::new(format!(
                        "Step output '{}' uses the default cache location but no cache root is configured",
                        descriptor.logical_path
                    ))
                    .with_key("cache_root"));
                }
                DEFAULT_TEMPLATE
            }
            CachePolicy::Template(template) => template.as_str(),
        };

        let key = (descriptor.clone(), identity.clone());
        if let Some(hit) = self.rendered.get(&key) {
            return Ok(Some(hit.value().clone()));
        }
        let rendered = self.render(template, &descriptor.logical_path, identity)?;
        let location = Location::parse(&rendered)?;
        Ok(Some(self.rendered.entry(key).or_insert(location).value().clone()))
    }

    fn render(&self, template: &str, logical_path: &str, identity: &CacheIdentity) -> Result<String, ConfigurationError> {
        let mut unknown = None;
        let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
            let value = match &caps[1] {
                "cacheRoot" => self.cache_root.as_deref().map(|r| r.trim_end_matches('/')),
                "hyperparameterSlug" => Some(identity.hyperparameter_slug.as_str()),
                "parameterVersion" => Some(identity.parameter_version.as_str()),
                "definitionHash" => Some(identity.definition_hash.as_str()),
                "logicalPath" => Some(logical_path),
                _ => None,
            };
            value.map_or_else(
                || {
                    unknown.get_or_insert_with(|| caps[0].to_string());
                    String::new()
                },
                str::to_string,
            )
        });
        if let Some(placeholder) = unknown {
            return Err(ConfigurationError::new(format!(
                "Cache template '{template}' uses {placeholder}, which is unknown or unset"
            )));
        }
        Ok(rendered.into_owned())
    }

    /// Returns a local path holding the artifact at `location`, if one exists.
    pub fn materialize(&self, location: &Location) -> ExpflowResult<Option<PathBuf>> {
        if let Some(local) = self.materialized.get(location) {
            return Ok(Some(local.value().clone()));
        }
        let local = match location {
            Location::Local(path) => {
                if !fs::has_content(path) {
                    return Ok(None);
                }
                path.clone()
            }
            Location::Remote(uri) => {
                let store = self.remote_store(location)?;
                if !store.exists(uri)? {
                    return Ok(None);
                }
                let target = self.download_path(location, uri.file_name());
                store.download(uri, &target)?;
                tracing::debug!(%location, local = %target.display(), "Downloaded cache entry");
                target
            }
        };
        Ok(Some(self.materialized.entry(location.clone()).or_insert(local).value().clone()))
    }

    /// Resolves and materializes in one step.
    pub fn lookup(&self, descriptor: &CacheDescriptor, identity: &CacheIdentity) -> ExpflowResult<CacheLookup> {
        let Some(location) = self.resolve(descriptor, identity)? else {
            return Ok(CacheLookup::Disabled);
        };
        Ok(match self.materialize(&location)? {
            Some(local) => CacheLookup::Hit { location, local },
            None => CacheLookup::Miss { location },
        })
    }

    /// Stores `produced` at `location`. Concurrent writers to one key are not coordinated.
    pub fn persist(&self, location: &Location, produced: &Path) -> Result<(), CacheError> {
        let fail = |message: String| CacheError::new(location.to_string(), message);
        match location {
            Location::Local(path) => fs::link_or_copy(produced, path).map_err(|e| fail(e.to_string())),
            Location::Remote(uri) => {
                let store = self.remote_store(location).map_err(|e| fail(e.message))?;
                let result = if produced.is_dir() {
                    upload_tree(store.as_ref(), produced, uri).map(|_| ())
                } else {
                    store.upload(produced, uri)
                };
                result.map_err(|e| fail(e.to_string()))
            }
        }
    }

    /// [`Self::persist`], logging instead of failing. Returns whether it worked.
    pub fn persist_or_warn(&self, location: &Location, produced: &Path) -> bool {
        match self.persist(location, produced) {
            Ok(()) => {
                tracing::info!(%location, "Persisted step output to cache");
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, "Cache persistence failed; continuing uncached");
                false
            }
        }
    }

    fn remote_store(&self, location: &Location) -> Result<&Arc<dyn ObjectStore>, ConfigurationError> {
        self.store.as_ref().ok_or_else(|| {
            ConfigurationError::new(format!("Cache location {location} is remote but no object store is configured"))
        })
    }

    fn download_path(&self, location: &Location, file_name: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(location.to_string().as_bytes());
        let digest = hasher.finalize();
        let name = if file_name.is_empty() { "entry" } else { file_name };
        self.scratch.join("cache").join(hex::encode(&digest[..8])).join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DirectoryObjectStore, MockObjectStore, RemoteUri};
    use pretty_assertions::assert_eq;

    fn identity() -> CacheIdentity {
        CacheIdentity {
            hyperparameter_slug: "ranker@1.0".to_string(),
            parameter_version: "last_train_date_2024-01-01-last_test_date_2024-01-02".to_string(),
            definition_hash: "abc123".to_string(),
        }
    }

    #[test]
    fn test_policy_none_is_disabled() {
        let resolver = CacheResolver::new(None, "/scratch");
        let descriptor = CacheDescriptor::new(CachePolicy::None, "x.zip");
        assert_eq!(resolver.lookup(&descriptor, &identity()).unwrap(), CacheLookup::Disabled);
    }

    #[test]
    fn test_default_location_requires_root() {
        let resolver = CacheResolver::new(None, "/scratch");
        let descriptor = CacheDescriptor::new(CachePolicy::DefaultLocation, "x.zip");
        let err = resolver.resolve(&descriptor, &identity()).unwrap_err();
        assert_eq!(err.key.as_deref(), Some("cache_root"));
    }

    #[test]
    fn test_default_location_layout() {
        let resolver = CacheResolver::new(Some("/cache/".to_string()), "/scratch");
        let descriptor = CacheDescriptor::new(CachePolicy::DefaultLocation, "predict-parameters.zip");
        let location = resolver.resolve(&descriptor, &identity()).unwrap().unwrap();
        assert_eq!(
            location,
            Location::Local(PathBuf::from(
                "/cache/ranker@1.0/abc123/last_train_date_2024-01-01-last_test_date_2024-01-02/predict-parameters.zip"
            ))
        );
        // idempotent
        assert_eq!(resolver.resolve(&descriptor, &identity()).unwrap().unwrap(), location);
    }

    #[test]
    fn test_explicit_template_and_unknown_placeholder() {
        let resolver = CacheResolver::new(None, "/scratch");
        let descriptor = CacheDescriptor::new(
            CachePolicy::Template("s3://bucket/{hyperparameterSlug}/{parameterVersion}.zip".to_string()),
            "ignored",
        );
        let location = resolver.resolve(&descriptor, &identity()).unwrap().unwrap();
        assert!(location.is_remote());
        assert_eq!(
            location.to_string(),
            "s3://bucket/ranker@1.0/last_train_date_2024-01-01-last_test_date_2024-01-02.zip"
        );

        let bad = CacheDescriptor::new(CachePolicy::Template("/c/{cacheRoot}/{nope}".to_string()), "x");
        assert!(resolver.resolve(&bad, &identity()).is_err());
    }

    #[test]
    fn test_local_miss_persist_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CacheResolver::new(Some(dir.path().join("cache").display().to_string()), dir.path());
        let descriptor = CacheDescriptor::new(CachePolicy::DefaultLocation, "state.bin");

        let CacheLookup::Miss { location } = resolver.lookup(&descriptor, &identity()).unwrap() else {
            panic!("expected a miss");
        };
        let produced = dir.path().join("state.bin");
        std::fs::write(&produced, "state").unwrap();
        assert!(resolver.persist_or_warn(&location, &produced));

        match resolver.lookup(&descriptor, &identity()).unwrap() {
            CacheLookup::Hit { local, .. } => assert_eq!(std::fs::read_to_string(local).unwrap(), "state"),
            other => panic!("expected a hit, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_hit_downloads_into_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DirectoryObjectStore::new(dir.path().join("remote")));
        let uri = RemoteUri::parse("s3://bucket/ranker/enc.zip").unwrap();
        let seed = dir.path().join("seed.zip");
        std::fs::write(&seed, "zip").unwrap();
        store.upload(&seed, &uri).unwrap();

        let resolver = CacheResolver::new(None, dir.path().join("scratch")).with_object_store(store);
        let descriptor = CacheDescriptor::new(CachePolicy::Template("s3://bucket/ranker/enc.zip".to_string()), "enc.zip");
        match resolver.lookup(&descriptor, &identity()).unwrap() {
            CacheLookup::Hit { local, .. } => {
                assert!(local.starts_with(dir.path().join("scratch")));
                assert_eq!(std::fs::read_to_string(local).unwrap(), "zip");
            }
            other => panic!("expected a hit, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_miss_when_absent() {
        let mut store = MockObjectStore::new();
        store.expect_exists().times(1).returning(|_| Ok(false));
        let resolver = CacheResolver::new(None, "/scratch").with_object_store(Arc::new(store));
        let descriptor = CacheDescriptor::new(CachePolicy::Template("s3://b/k".to_string()), "k");
        assert!(matches!(
            resolver.lookup(&descriptor, &identity()).unwrap(),
            CacheLookup::Miss { .. }
        ));
    }

    #[test]
    fn test_remote_persist_failure_is_non_fatal() {
        let mut store = MockObjectStore::new();
        store
            .expect_upload()
            .returning(|_, _| Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into()));
        let resolver = CacheResolver::new(None, "/scratch").with_object_store(Arc::new(store));
        let location = Location::parse("s3://b/k").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let produced = dir.path().join("f");
        std::fs::write(&produced, "x").unwrap();

        assert!(resolver.persist(&location, &produced).is_err());
        assert!(!resolver.persist_or_warn(&location, &produced));
    }

    #[test]
    fn test_remote_without_store_is_configuration_error() {
        let resolver = CacheResolver::new(None, "/scratch");
        let location = Location::parse("s3://b/k").unwrap();
        assert!(resolver.materialize(&location).is_err());
    }
}
