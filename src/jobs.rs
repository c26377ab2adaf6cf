//! Job submit files parsed in from the command line.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use batchwright_engine::BatchJob;
use batchwright_engine::job::is_valid_job_id;
use serde::Deserialize;
use serde::Serialize;

/// Helper for formatting an unsupported file format error.
fn unsupported_file_extension(path: impl fmt::Display) -> anyhow::Error {
    anyhow!(
        "unsupported submit file `{path}`: the supported formats are JSON (`.json`) or YAML \
         (`.yaml` and `.yml`)"
    )
}

/// Supported submit file formats.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Format {
    /// The submit file is a JSON file.
    Json,
    /// The submit file is a YAML file.
    Yaml,
}

/// The contents of a submit file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmitFile {
    /// The jobs to submit, in order.
    #[serde(rename = "SubmitJob", default)]
    pub jobs: Vec<BatchJob>,
}

impl SubmitFile {
    /// Ensures every job has a valid, unique id.
    fn validate(&self, path: impl fmt::Display) -> Result<()> {
        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.id.trim().is_empty() {
                bail!("submit file `{path}` contains a job with an empty `jobName`");
            }

            if !is_valid_job_id(&job.id) {
                bail!(
                    "submit file `{path}` contains a job named `{id}`: names may only contain \
                     letters, digits, `-` and `_` (at most 128 characters)",
                    id = job.id
                );
            }

            if !seen.insert(job.id.as_str()) {
                bail!(
                    "submit file `{path}` contains more than one job named `{id}`",
                    id = job.id
                );
            }
        }

        Ok(())
    }
}

/// Parses the contents of a submit file in the given format.
fn parse(format: Format, contents: &str, path: impl fmt::Display) -> Result<SubmitFile> {
    let file: SubmitFile = match format {
        Format::Json => serde_json::from_str(contents)
            .with_context(|| format!("failed to deserialize JSON submit file `{path}`"))?,
        Format::Yaml => serde_yaml_ng::from_str(contents)
            .with_context(|| format!("failed to deserialize YAML submit file `{path}`"))?,
    };

    file.validate(path)?;
    Ok(file)
}

/// Reads a submit file.
///
/// The file is parsed based on its extension; the supported formats are JSON
/// and YAML.
pub async fn read_submit_file(path: &Path) -> Result<SubmitFile> {
    if path.is_dir() {
        bail!(
            "a submit file cannot be read from directory `{path}`",
            path = path.display()
        );
    }

    let format = match path.extension().and_then(OsStr::to_str) {
        Some("json") => Format::Json,
        Some("yml") | Some("yaml") => Format::Yaml,
        _ => return Err(unsupported_file_extension(path.display())),
    };

    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read submit file `{path}`", path = path.display()))?;

    parse(format, &contents, path.display())
}
