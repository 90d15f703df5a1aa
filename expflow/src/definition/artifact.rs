//! Reading definitions out of an algorithm artifact.

use super::AlgorithmDefinition;
use crate::errors::{ConfigurationError, ExpflowResult};
use crate::storage::archive;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the definition entry for `algorithm_name`.
#[must_use]
pub fn definition_entry_name(algorithm_name: &str) -> String {
    format!("{algorithm_name}-algorithm-definition.json")
}

/// A built algorithm artifact: a zip archive, or an unpacked directory.
///
/// The artifact carries the definitions of its algorithm and of every
/// algorithm it depends on, each under [`definition_entry_name`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlgorithmArtifact {
    path: PathBuf,
}

impl AlgorithmArtifact {
    /// Wraps an artifact path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Artifact location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the definition published for `algorithm_name`.
    pub fn read_definition(&self, algorithm_name: &str) -> ExpflowResult<AlgorithmDefinition> {
        let entry = definition_entry_name(algorithm_name);
        let text = if self.path.is_dir() {
            let file = self.path.join(&entry);
            if !file.is_file() {
                return Err(self.missing(&entry).into());
            }
            std::fs::read_to_string(file)?
        } else {
            let bytes = archive::read_entry(&self.path, &entry)?.ok_or_else(|| self.missing(&entry))?;
            String::from_utf8(bytes).map_err(|e| ConfigurationError::new(format!("{entry} is not UTF-8: {e}")))?
        };

        let definition = AlgorithmDefinition::from_json(&text)?;
        if definition.name() != algorithm_name {
            return Err(ConfigurationError::new(format!(
                "{entry} in {} declares algorithm '{}'",
                self.path.display(),
                definition.name()
            ))
            .into());
        }
        Ok(definition)
    }

    fn missing(&self, entry: &str) -> ConfigurationError {
        ConfigurationError::new(format!(
            "Artifact {} does not contain {entry}",
            self.path.display()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::archive::{write_package, PackageEntry};

    const DEFINITION: &str = r#"{"algorithm_name": "ranker", "algorithm_version": "3.1"}"#;

    #[test]
    fn test_read_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ranker-algorithm-definition.json"), DEFINITION).unwrap();
        let artifact = AlgorithmArtifact::new(dir.path());
        assert_eq!(artifact.read_definition("ranker").unwrap().version(), "3.1");
        assert!(artifact.read_definition("other").is_err());
    }

    #[test]
    fn test_read_from_zip() {
        let dir = tempfile::tempdir().unwrap();
        let def = dir.path().join("def.json");
        std::fs::write(&def, DEFINITION).unwrap();
        let jar = dir.path().join("ranker.jar");
        write_package(&jar, &[PackageEntry::new("ranker-algorithm-definition.json", &def)]).unwrap();

        let artifact = AlgorithmArtifact::new(&jar);
        assert_eq!(artifact.read_definition("ranker").unwrap().slug(), "ranker@3.1");
        assert!(artifact.read_definition("missing").is_err());
    }

    #[test]
    fn test_name_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("other-algorithm-definition.json"), DEFINITION).unwrap();
        assert!(AlgorithmArtifact::new(dir.path()).read_definition("other").is_err());
    }
}
