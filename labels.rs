use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

pub const UNKNOWN_LABEL: &str = "Unknown";

/// Class names in model output order: line `i` names output index `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelTable {
    labels: Vec<String>,
}

impl LabelTable {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn from_text(contents: &str) -> Self {
        let mut labels: Vec<String> = contents
            .lines()
            .map(|line| line.trim().to_string())
            .collect();
        // Interior blank lines keep their slot so later indices stay aligned.
        while labels.last().is_some_and(|label| label.is_empty()) {
            labels.pop();
        }
        Self { labels }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            Error::AssetLoad(format!("Failed to read labels from {}: {err}", path.display()))
        })?;
        let table = Self::from_text(&contents);
        if table.is_empty() {
            return Err(Error::AssetLoad(format!(
                "Labels file is empty: {}",
                path.display()
            )));
        }
        log::info!("Loaded {} labels from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    /// Indices past the end of the table map to [`UNKNOWN_LABEL`].
    pub fn label_for(&self, index: usize) -> &str {
        self.get(index).unwrap_or(UNKNOWN_LABEL)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for LabelTable {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}

pub fn sidecar_path(model_path: &Path) -> PathBuf {
    model_path.with_extension("labels.txt")
}
