//! Extraction manifest: the authoritative skip/rework oracle
//!
//! A JSON file updated only on success, written atomically via
//! write-temp-then-rename so abnormal termination never corrupts it.

use crate::error::{ExtractionError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Per-document manifest entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file_hash: String,
    pub extracted_at: DateTime<Utc>,
    pub extraction_cost: f64,
    #[serde(default)]
    pub indexed_to_vi: bool,
    #[serde(default)]
    pub indexed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub chunk_count: Option<usize>,
}

/// The manifest file, keyed by document id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub documents: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Manifest path inside an extracted-documents directory
    pub fn path_in(extracted_dir: &Path) -> PathBuf {
        extracted_dir.join("manifest.json")
    }

    /// Load the manifest, or an empty one if the file does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let manifest = serde_json::from_str(&content)
            .map_err(|e| ExtractionError::Manifest(format!("unparseable manifest: {}", e)))?;
        Ok(manifest)
    }

    /// Persist atomically: write a temp file in the same directory, then
    /// rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Whether a document needs extraction given the skip flags
    pub fn needs_extraction(
        &self,
        document_id: &str,
        file_hash: &str,
        force: bool,
        if_changed: bool,
    ) -> bool {
        if force {
            return true;
        }
        match self.documents.get(document_id) {
            None => true,
            Some(entry) => if_changed && entry.file_hash != file_hash,
        }
    }

    /// Whether a document needs (re-)indexing
    pub fn needs_indexing(&self, document_id: &str, reindex: bool) -> bool {
        if reindex {
            return true;
        }
        match self.documents.get(document_id) {
            None => false, // nothing extracted yet
            Some(entry) => !entry.indexed_to_vi,
        }
    }

    /// Record a successful extraction
    pub fn record_extraction(&mut self, document_id: &str, file_hash: &str, cost: f64) {
        self.documents.insert(
            document_id.to_string(),
            ManifestEntry {
                file_hash: file_hash.to_string(),
                extracted_at: Utc::now(),
                extraction_cost: cost,
                indexed_to_vi: false,
                indexed_at: None,
                chunk_count: None,
            },
        );
    }

    /// Record a successful indexing pass
    pub fn record_indexing(&mut self, document_id: &str, chunk_count: usize) -> Result<()> {
        let entry = self.documents.get_mut(document_id).ok_or_else(|| {
            ExtractionError::Manifest(format!("document not in manifest: {}", document_id))
        })?;
        entry.indexed_to_vi = true;
        entry.indexed_at = Some(Utc::now());
        entry.chunk_count = Some(chunk_count);
        Ok(())
    }
}

/// Compute the MD5 content digest used for change detection
pub fn file_hash(content: &[u8]) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
