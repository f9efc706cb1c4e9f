use std::path::{Path, PathBuf};

use super::{Dataset, DatasetResolver, ResolveError};

const BASE_VARIANT: &str = "base";

/// Loads datasets from `<root>/<dataset_ref>/<variant>.json`.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    root: PathBuf,
}

impl DirectoryResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// A reference must be a single plain path component.
fn component(raw: &str) -> Result<&str, ResolveError> {
    let trimmed = raw.trim();
    let valid = !trimmed.is_empty()
        && trimmed != "."
        && trimmed != ".."
        && !trimmed.contains(['/', '\\'])
        && !trimmed.contains('\0');
    if valid {
        Ok(trimmed)
    } else {
        Err(ResolveError::InvalidReference(raw.to_string()))
    }
}

#[async_trait::async_trait]
impl DatasetResolver for DirectoryResolver {
    async fn resolve(
        &self,
        dataset_ref: &str,
        variant: Option<&str>,
    ) -> Result<Dataset, ResolveError> {
        let name = component(dataset_ref)?;
        let file = component(variant.unwrap_or(BASE_VARIANT))?;
        let path = self.root.join(name).join(format!("{file}.json"));

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResolveError::NotFound(match variant {
                    Some(v) => format!("{name}/{v}"),
                    None => name.to_string(),
                }))
            }
            Err(err) => {
                return Err(ResolveError::Unreadable {
                    name: name.to_string(),
                    reason: err.to_string(),
                })
            }
        };

        let mut dataset: Dataset =
            serde_json::from_str(&content).map_err(|err| ResolveError::Unreadable {
                name: name.to_string(),
                reason: err.to_string(),
            })?;
        dataset.name = name.to_string();
        dataset.variant = variant.map(str::to_string);
        tracing::debug!(dataset = name, buses = dataset.buses.len(), "dataset resolved");
        Ok(dataset)
    }
}
