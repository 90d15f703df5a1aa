//! Free-form training command templates.

use super::process::{run_shell, shell_quote, ProcessOutput};
use crate::errors::{ConfigurationError, ExpflowResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static VARIABLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("valid variable pattern"));

/// Values available to a training command template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainingVariables {
    /// `{algorithmDefinitionPath}`
    pub algorithm_definition_path: PathBuf,
    /// `{algorithmArtifactPath}`
    pub algorithm_artifact_path: PathBuf,
    /// `{encodedDataPath}`
    pub encoded_data_path: PathBuf,
    /// `{encodedSchemaDescriptionPath}`
    pub encoded_schema_description_path: PathBuf,
    /// `{parameterOutputPath}`
    pub parameter_output_path: PathBuf,
    /// `{scratchDir}`
    pub scratch_dir: PathBuf,
    /// `{runtimeExecutablePath}`, when the context provides one.
    pub runtime_executable_path: Option<PathBuf>,
}

impl TrainingVariables {
    fn lookup(&self, name: &str) -> Option<&Path> {
        match name {
            "algorithmDefinitionPath" => Some(self.algorithm_definition_path.as_path()),
            "algorithmArtifactPath" => Some(self.algorithm_artifact_path.as_path()),
            "encodedDataPath" => Some(self.encoded_data_path.as_path()),
            "encodedSchemaDescriptionPath" => Some(self.encoded_schema_description_path.as_path()),
            "parameterOutputPath" => Some(self.parameter_output_path.as_path()),
            "scratchDir" => Some(self.scratch_dir.as_path()),
            "runtimeExecutablePath" => self.runtime_executable_path.as_deref(),
            _ => None,
        }
    }
}

/// A training command template such as
/// `{runtimeExecutablePath} train.py --data {encodedDataPath} --out {parameterOutputPath}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingCommand {
    template: String,
}

impl TrainingCommand {
    /// Wraps a template.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Substitutes every variable, each quoted as a single shell word.
    ///
    /// Unknown or unset variables are an error.
    pub fn render(&self, vars: &TrainingVariables) -> Result<String, ConfigurationError> {
        let mut missing = Vec::new();
        let rendered = VARIABLE.replace_all(&self.template, |caps: &regex::Captures<'_>| {
            vars.lookup(&caps[1]).map_or_else(
                || {
                    missing.push(caps[0].to_string());
                    String::new()
                },
                |path| shell_quote(&path.display().to_string()),
            )
        });
        if missing.is_empty() {
            Ok(rendered.into_owned())
        } else {
            Err(ConfigurationError::new(format!(
                "Training command uses unknown or unset variables: {}",
                missing.join(", ")
            ))
            .with_key("training.command"))
        }
    }

    /// Renders and runs the command in `vars.scratch_dir`.
    pub fn run(&self, vars: &TrainingVariables) -> ExpflowResult<ProcessOutput> {
        let command_line = self.render(vars)?;
        std::fs::create_dir_all(&vars.scratch_dir)?;
        if let Some(parent) = vars.parameter_output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        tracing::info!(command = %command_line, "Running training command");
        run_shell(&command_line, Some(&vars.scratch_dir))
    }
}
