//! Image model and reference matching.

use crate::engine::EngineInfo;
use crate::types::ImageSummary;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Minimum length for image ID prefix matching, to avoid pathologically
/// short collisions.
const MIN_ID_PREFIX: usize = 3;

/// An image mirrored from one engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    /// Image ID (content digest form).
    pub id: String,
    /// `repo:tag` references.
    pub repo_tags: Vec<String>,
    /// Creation time, Unix seconds.
    pub created: i64,
    /// Size in bytes.
    pub size: i64,
    /// Image labels.
    pub labels: HashMap<String, String>,
    /// The engine holding this image.
    pub engine: EngineInfo,
}

impl Image {
    /// Builds an image from a listing entry.
    #[must_use]
    pub fn from_summary(summary: ImageSummary, engine: EngineInfo) -> Self {
        Self {
            id: summary.id,
            repo_tags: summary.repo_tags,
            created: summary.created,
            size: summary.size,
            labels: summary.labels,
            engine,
        }
    }

    /// Whether `term` refers to this image: full ID, ID prefix of at least
    /// three characters (with or without the `sha256:` prefix), `repo:tag`,
    /// or bare repo (implying `:latest`).
    #[must_use]
    pub fn matches(&self, term: &str) -> bool {
        if term.is_empty() {
            return false;
        }
        if self.id == term {
            return true;
        }
        let bare_id = self.id.strip_prefix("sha256:").unwrap_or(&self.id);
        if term.len() >= MIN_ID_PREFIX && (self.id.starts_with(term) || bare_id.starts_with(term)) {
            return true;
        }
        self.repo_tags
            .iter()
            .any(|t| t == term || t == &format!("{term}:latest"))
    }
}

/// A flattened cluster-wide image listing.
#[derive(Debug, Clone, Default)]
pub struct Images(pub Vec<Image>);

impl Images {
    /// Resolves an image by reference.
    ///
    /// The same image is commonly present on several engines; candidates
    /// sharing an ID count as one match. Candidates with different IDs make
    /// the lookup ambiguous, which resolves to nothing.
    #[must_use]
    pub fn get(&self, term: &str) -> Option<&Image> {
        let candidates: Vec<&Image> = self.0.iter().filter(|i| i.matches(term)).collect();
        let first = candidates.first()?;
        if candidates.iter().all(|i| i.id == first.id) {
            Some(first)
        } else {
            None
        }
    }
}
