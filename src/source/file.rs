//! EndpointSlice listing from a file
//!
//! Reads a JSON document holding either an EndpointSlice list
//! (`{"items": [...]}`) or a bare array of slices, as written by a sidecar
//! or by `kubectl get endpointslices -o json`. A missing file lists no
//! slices.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use serde::Deserialize;

use super::{EndpointSlice, EndpointSliceList, SliceLister};
use crate::error::{SyncError, SyncResult};

#[derive(Deserialize)]
#[serde(untagged)]
enum SliceDocument {
    List(EndpointSliceList),
    Slices(Vec<EndpointSlice>),
}

/// Lists slices from a JSON file on every poll
#[derive(Debug, Clone)]
pub struct FileLister {
    path: PathBuf,
}

impl FileLister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse a slice document
pub fn parse_slices(text: &str) -> SyncResult<Vec<EndpointSlice>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let document: SliceDocument = serde_json::from_str(text)
        .map_err(|e| SyncError::Source(format!("invalid endpoint slice document: {}", e)))?;
    Ok(match document {
        SliceDocument::List(list) => list.items,
        SliceDocument::Slices(slices) => slices,
    })
}

#[async_trait]
impl SliceLister for FileLister {
    async fn list(&self) -> SyncResult<Vec<EndpointSlice>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => parse_slices(&text),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(SyncError::Io(e)),
        }
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parses_list_and_array_forms() {
        let list = r#"{"apiVersion": "discovery.k8s.io/v1", "kind": "EndpointSliceList",
            "items": [{"metadata": {"name": "web-x"}, "endpoints": []}]}"#;
        assert_eq!(parse_slices(list).unwrap()[0].name(), "web-x");

        let array = r#"[{"metadata": {"name": "web-y"}, "endpoints": []}]"#;
        assert_eq!(parse_slices(array).unwrap()[0].name(), "web-y");

        assert!(parse_slices("").unwrap().is_empty());
        assert!(matches!(parse_slices("{oops"), Err(SyncError::Source(_))));
    }

    #[tokio::test]
    async fn test_reads_file_and_tolerates_missing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"items": [{{"metadata": {{"name": "web-abc"}},
                "endpoints": [{{"addresses": ["10.0.0.2"], "targetRef": {{"name": "web-0"}}}}]}}]}}"#
        )
        .unwrap();

        let lister = FileLister::new(file.path());
        let slices = lister.list().await.unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].endpoints[0].identity(), Some("web-0"));

        let dir = tempfile::tempdir().unwrap();
        let missing = FileLister::new(dir.path().join("absent.json"));
        assert!(missing.list().await.unwrap().is_empty());
    }
}
