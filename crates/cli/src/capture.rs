//! Recorded captures: a JSON manifest next to the raw frame stream it
//! describes, replayed through a client that answers from the manifest.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memcct_core::client::{ClientError, HeapHistogram, ProfilerClient};
use memcct_core::model::MethodNames;
use memcct_protocol::{MethodId, SharedStr};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ClassEntry {
    pub id: u16,
    pub name: SharedStr,
}

#[derive(Debug, Deserialize)]
pub struct MethodEntry {
    pub id: u32,
    pub class_name: SharedStr,
    pub method_name: SharedStr,
    #[serde(default)]
    pub signature: SharedStr,
}

#[derive(Debug, Deserialize)]
pub struct CaptureManifest {
    /// Frame stream, relative to the manifest.
    pub frames: PathBuf,
    #[serde(default)]
    pub classes: Vec<ClassEntry>,
    #[serde(default)]
    pub methods: Vec<MethodEntry>,
    #[serde(default)]
    pub allocation_counts: Vec<i64>,
    #[serde(default)]
    pub heap_histogram: Option<HeapHistogram>,
}

pub struct Capture {
    pub manifest: CaptureManifest,
    pub frames: Vec<u8>,
}

impl Capture {
    pub fn load(path: &Path) -> Result<Capture> {
        let text = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let manifest: CaptureManifest = serde_json::from_slice(&text)
            .with_context(|| format!("parsing capture manifest {}", path.display()))?;
        let frames_path = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&manifest.frames);
        let frames = std::fs::read(&frames_path)
            .with_context(|| format!("reading frames {}", frames_path.display()))?;
        tracing::info!(
            manifest = %path.display(),
            bytes = frames.len(),
            classes = manifest.classes.len(),
            "capture loaded"
        );
        Ok(Capture { manifest, frames })
    }

    pub fn client(&self) -> ReplayClient {
        ReplayClient {
            names: self
                .manifest
                .methods
                .iter()
                .map(|m| {
                    let names = MethodNames::new(
                        m.class_name.clone(),
                        m.method_name.clone(),
                        m.signature.clone(),
                    );
                    (MethodId(m.id), names)
                })
                .collect(),
            counts: self.manifest.allocation_counts.clone(),
            histogram: self.manifest.heap_histogram.clone(),
        }
    }
}

/// Answers agent round-trips from what the manifest recorded.
pub struct ReplayClient {
    names: HashMap<MethodId, MethodNames>,
    counts: Vec<i64>,
    histogram: Option<HeapHistogram>,
}

impl ProfilerClient for ReplayClient {
    fn allocated_objects_count_results(&self) -> Result<Vec<i64>, ClientError> {
        Ok(self.counts.clone())
    }

    fn heap_histogram(&self) -> Result<HeapHistogram, ClientError> {
        self.histogram
            .clone()
            .ok_or_else(|| ClientError::Communication("capture has no heap histogram".to_owned()))
    }

    fn method_names_for_ids(&self, ids: &[MethodId]) -> Result<Vec<MethodNames>, ClientError> {
        Ok(ids
            .iter()
            .map(|id| {
                self.names
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| MethodNames::unknown(*id))
            })
            .collect())
    }
}
