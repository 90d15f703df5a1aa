//! Turning artifact references into local algorithm artifacts.

use crate::definition::AlgorithmArtifact;
use crate::engine::run_shell;
use crate::errors::{ConfigurationError, ExpflowResult};
use std::path::{Path, PathBuf};

/// Extensions recognized as packaged artifacts in a build output directory.
const PACKAGE_EXTENSIONS: [&str; 2] = ["jar", "zip"];

/// Builds or fetches the artifact behind a reference (a git ref, a release tag, ...).
pub trait ArtifactResolver: Send + Sync {
    /// Returns the artifact for `reference`.
    fn resolve(&self, reference: &str) -> ExpflowResult<AlgorithmArtifact>;
}

fn check_reference(reference: &str) -> Result<(), ConfigurationError> {
    let valid = !reference.is_empty()
        && reference != "."
        && reference != ".."
        && !reference.contains(['/', '\\']);
    if valid {
        Ok(())
    } else {
        Err(ConfigurationError::new(format!("'{reference}' is not a valid artifact reference")).with_key("reference"))
    }
}

/// Prebuilt artifacts stored as `{root}/{reference}`.
#[derive(Debug, Clone)]
pub struct DirectoryArtifactResolver {
    root: PathBuf,
}

impl DirectoryArtifactResolver {
    /// Creates a resolver over `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactResolver for DirectoryArtifactResolver {
    fn resolve(&self, reference: &str) -> ExpflowResult<AlgorithmArtifact> {
        check_reference(reference)?;
        let path = self.root.join(reference);
        if !path.exists() {
            return Err(ConfigurationError::new(format!(
                "No artifact for reference '{reference}' below {}",
                self.root.display()
            ))
            .into());
        }
        Ok(AlgorithmArtifact::new(path))
    }
}

/// Runs a build command per reference.
///
/// The template may use `{reference}` and `{outputDir}`; the command must
/// leave the artifact in `{outputDir}`. A single `.jar`/`.zip` file there is
/// the artifact, otherwise the directory itself is.
#[derive(Debug, Clone)]
pub struct CommandArtifactResolver {
    template: String,
    output_root: PathBuf,
}

impl CommandArtifactResolver {
    /// Creates a resolver building into `{output_root}/{reference}`.
    #[must_use]
    pub fn new(template: impl Into<String>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            output_root: output_root.into(),
        }
    }

    /// Renders the build command for `reference`.
    #[must_use]
    pub fn render(&self, reference: &str, output_dir: &Path) -> String {
        self.template
            .replace("{reference}", reference)
            .replace("{outputDir}", &output_dir.display().to_string())
    }
}

impl ArtifactResolver for CommandArtifactResolver {
    fn resolve(&self, reference: &str) -> ExpflowResult<AlgorithmArtifact> {
        check_reference(reference)?;
        let output_dir = self.output_root.join(reference);
        std::fs::create_dir_all(&output_dir)?;

        let command = self.render(reference, &output_dir);
        tracing::info!(reference, output_dir = %output_dir.display(), "Building artifact");
        let output = run_shell(&command, None)?;
        tracing::debug!(reference, duration_ms = output.duration_ms, "Artifact built");

        Ok(AlgorithmArtifact::new(single_package(&output_dir)?.unwrap_or(output_dir)))
    }
}

fn single_package(dir: &Path) -> ExpflowResult<Option<PathBuf>> {
    let mut packages = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_package = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| PACKAGE_EXTENSIONS.contains(&e));
        if path.is_file() && is_package {
            packages.push(path);
        }
    }
    Ok(if packages.len() == 1 { packages.pop() } else { None })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_directory_resolver() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("v1")).unwrap();
        let resolver = DirectoryArtifactResolver::new(dir.path());

        assert_eq!(resolver.resolve("v1").unwrap().path(), dir.path().join("v1"));
        assert!(resolver.resolve("v2").is_err());
        assert!(resolver.resolve("../v1").is_err());
        assert!(resolver.resolve("").is_err());
    }

    #[test]
    fn test_command_render() {
        let resolver = CommandArtifactResolver::new("build --ref {reference} --out {outputDir}", "/builds");
        assert_eq!(
            resolver.render("abc123", Path::new("/builds/abc123")),
            "build --ref abc123 --out /builds/abc123"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_command_resolver_picks_single_package() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CommandArtifactResolver::new("touch {outputDir}/algo-{reference}.jar", dir.path());
        let artifact = resolver.resolve("main").unwrap();
        assert_eq!(artifact.path(), dir.path().join("main/algo-main.jar"));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_resolver_falls_back_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CommandArtifactResolver::new("touch {outputDir}/a.jar {outputDir}/b.jar", dir.path());
        assert_eq!(resolver.resolve("main").unwrap().path(), dir.path().join("main"));

        let failing = CommandArtifactResolver::new("exit 3", dir.path());
        assert!(failing.resolve("main").is_err());
    }
}
