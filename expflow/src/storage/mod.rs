//! Artifact storage: local paths, remote object stores and zip packages.
//!
//! The orchestrator only needs three object-store operations (existence,
//! upload, download), captured by [`ObjectStore`]. [`DirectoryObjectStore`]
//! implements them over a local directory, which is also how tests and
//! single-host deployments mirror a remote bucket.

pub mod archive;
pub mod fs;

use crate::errors::{ConfigurationError, ExpflowResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A `scheme://bucket/key` location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteUri {
    /// URI scheme, e.g. `s3`.
    pub scheme: String,
    /// Bucket (authority) part.
    pub bucket: String,
    /// Key below the bucket, without leading slash.
    pub key: String,
}

impl RemoteUri {
    /// Parses `scheme://bucket[/key]`.
    pub fn parse(uri: &str) -> Result<Self, ConfigurationError> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| ConfigurationError::new(format!("'{uri}' is not a remote URI")))?;
        if scheme.is_empty() || scheme == "file" {
            return Err(ConfigurationError::new(format!("'{uri}' is not a remote URI")));
        }
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ConfigurationError::new(format!("'{uri}' has no bucket")));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.trim_matches('/').to_string(),
        })
    }

    /// Appends path segments to the key.
    #[must_use]
    pub fn join(&self, segment: &str) -> Self {
        let segment = segment.trim_matches('/');
        let key = match (self.key.is_empty(), segment.is_empty()) {
            (true, _) => segment.to_string(),
            (false, true) => self.key.clone(),
            (false, false) => format!("{}/{segment}", self.key),
        };
        Self {
            key,
            ..self.clone()
        }
    }

    /// Last key segment.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or_default()
    }

    /// The URI of `name` in the same prefix as this object.
    #[must_use]
    pub fn sibling(&self, name: &str) -> Self {
        let parent = self.key.rsplit_once('/').map_or("", |(parent, _)| parent);
        Self {
            scheme: self.scheme.clone(),
            bucket: self.bucket.clone(),
            key: parent.to_string(),
        }
        .join(name)
    }
}

impl fmt::Display for RemoteUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "{}://{}", self.scheme, self.bucket)
        } else {
            write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
        }
    }
}

/// A rendered artifact location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// Local filesystem path.
    Local(PathBuf),
    /// Object-store URI.
    Remote(RemoteUri),
}

impl Location {
    /// Interprets a rendered template: anything with a non-`file` scheme is remote.
    pub fn parse(location: &str) -> Result<Self, ConfigurationError> {
        if let Some(path) = location.strip_prefix("file://") {
            return Ok(Self::Local(PathBuf::from(path)));
        }
        if location.contains("://") {
            return RemoteUri::parse(location).map(Self::Remote);
        }
        if location.is_empty() {
            return Err(ConfigurationError::new("Empty artifact location"));
        }
        Ok(Self::Local(PathBuf::from(location)))
    }

    /// Returns true for object-store locations.
    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(uri) => write!(f, "{uri}"),
        }
    }
}

/// The object-store operations the orchestrator relies on.
///
/// Keys behave like paths: a URI may name a single object or a prefix
/// holding several.
#[cfg_attr(test, mockall::automock)]
pub trait ObjectStore: Send + Sync {
    /// Returns true if an object or a non-empty prefix exists at `uri`.
    fn exists(&self, uri: &RemoteUri) -> ExpflowResult<bool>;

    /// Uploads a local file to `uri`.
    fn upload(&self, local: &Path, uri: &RemoteUri) -> ExpflowResult<()>;

    /// Downloads the object (or every object below the prefix) at `uri` into `local`.
    fn download(&self, uri: &RemoteUri, local: &Path) -> ExpflowResult<()>;
}

/// Uploads every file below `local_dir` to `uri`, preserving relative paths.
pub fn upload_tree(store: &dyn ObjectStore, local_dir: &Path, uri: &RemoteUri) -> ExpflowResult<usize> {
    let mut uploaded = 0;
    for item in WalkDir::new(local_dir).sort_by_file_name() {
        let item = item?;
        if !item.file_type().is_file() {
            continue;
        }
        let relative = item.path().strip_prefix(local_dir).unwrap_or(item.path());
        let key = relative.to_string_lossy().replace('\\', "/");
        store.upload(item.path(), &uri.join(&key))?;
        uploaded += 1;
    }
    tracing::debug!(local = %local_dir.display(), %uri, uploaded, "Uploaded directory");
    Ok(uploaded)
}

/// Object store mirrored into a local directory as `{root}/{scheme}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct DirectoryObjectStore {
    root: PathBuf,
}

impl DirectoryObjectStore {
    /// Creates a store rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Local path backing `uri`.
    #[must_use]
    pub fn path_for(&self, uri: &RemoteUri) -> PathBuf {
        let mut path = self.root.join(&uri.scheme).join(&uri.bucket);
        for segment in uri.key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        path
    }
}

impl ObjectStore for DirectoryObjectStore {
    fn exists(&self, uri: &RemoteUri) -> ExpflowResult<bool> {
        Ok(fs::has_content(&self.path_for(uri)))
    }

    fn upload(&self, local: &Path, uri: &RemoteUri) -> ExpflowResult<()> {
        let target = self.path_for(uri);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(local, &target)?;
        Ok(())
    }

    fn download(&self, uri: &RemoteUri, local: &Path) -> ExpflowResult<()> {
        let source = self.path_for(uri);
        if !source.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no object at {uri}"),
            )
            .into());
        }
        fs::link_or_copy(&source, local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_remote_uri_parse_and_join() {
        let uri = RemoteUri::parse("s3://bucket/a/b/").unwrap();
        assert_eq!(uri.key, "a/b");
        assert_eq!(uri.join("c.zip").to_string(), "s3://bucket/a/b/c.zip");
        assert_eq!(uri.join("c.zip").file_name(), "c.zip");
        assert_eq!(RemoteUri::parse("s3://bucket").unwrap().join("x").to_string(), "s3://bucket/x");
        assert!(RemoteUri::parse("/local/path").is_err());
        assert!(RemoteUri::parse("s3:///key").is_err());

        let result = RemoteUri::parse("s3://bucket/runs/job/result.json").unwrap();
        assert_eq!(result.sibling("failure.json").to_string(), "s3://bucket/runs/job/failure.json");
        assert_eq!(
            RemoteUri::parse("s3://bucket/top.json").unwrap().sibling("x").to_string(),
            "s3://bucket/x"
        );
    }

    #[test]
    fn test_location_parse() {
        assert!(Location::parse("s3://b/k").unwrap().is_remote());
        assert_eq!(Location::parse("/tmp/x").unwrap(), Location::Local(PathBuf::from("/tmp/x")));
        assert_eq!(Location::parse("file:///tmp/x").unwrap(), Location::Local(PathBuf::from("/tmp/x")));
        assert!(Location::parse("").is_err());
    }

    #[test]
    fn test_directory_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryObjectStore::new(dir.path().join("bucket-root"));
        let uri = RemoteUri::parse("s3://b/runs/x/result.json").unwrap();
        assert!(!store.exists(&uri).unwrap());

        let local = dir.path().join("result.json");
        std::fs::write(&local, "{}").unwrap();
        store.upload(&local, &uri).unwrap();
        assert!(store.exists(&uri).unwrap());
        assert!(store.exists(&RemoteUri::parse("s3://b/runs").unwrap()).unwrap());

        let back = dir.path().join("down/result.json");
        store.download(&uri, &back).unwrap();
        assert_eq!(std::fs::read_to_string(back).unwrap(), "{}");
        assert!(store.download(&uri.join("nope"), &dir.path().join("n")).is_err());
    }

    #[test]
    fn test_upload_tree() {
        let dir = tempfile::tempdir().unwrap();
        let meta = dir.path().join("meta");
        std::fs::create_dir_all(meta.join("steps")).unwrap();
        std::fs::write(meta.join("result.json"), "{}").unwrap();
        std::fs::write(meta.join("steps/encode.json"), "{}").unwrap();

        let store = DirectoryObjectStore::new(dir.path().join("remote"));
        let base = RemoteUri::parse("s3://b/out").unwrap();
        assert_eq!(upload_tree(&store, &meta, &base).unwrap(), 2);
        assert!(store.exists(&base.join("steps/encode.json")).unwrap());
    }
}
