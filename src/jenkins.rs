//! Jenkins REST Interface
//!
//! URL builders and payload shapes for the three endpoints the poller hits:
//! the per-lane build index, per-build metadata (pruned by a `tree` query),
//! and the per-build failure report artifact (json-lines, may 404).

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Fields requested from the build-metadata endpoint. Keeping the tree query
/// narrow keeps the cached payloads small.
const METADATA_TREE: &str =
    "actions[parameters[*],lastBuiltRevision[*],remoteUrls[*]],timestamp,building,result";

/// File name of the per-build failure report artifact, as produced by the CI
/// harness's test wrapper.
pub const REPORT_ARTIFACT: &str = "babysitter_report.json_lines";

/// Human-readable base page for a lane
pub fn lane_base_url(server: &str, lane_tag: &str) -> String {
    format!("{}/job/{}", server.trim_end_matches('/'), lane_tag)
}

/// JSON index of a lane's builds
pub fn lane_api_url(server: &str, lane_tag: &str) -> String {
    format!("{}/api/json", lane_base_url(server, lane_tag))
}

/// Human-readable page for one build
pub fn build_base_url(server: &str, lane_tag: &str, build_id: &str) -> String {
    format!("{}/{}", lane_base_url(server, lane_tag), build_id)
}

/// Pruned JSON metadata for one build
pub fn build_api_url(server: &str, lane_tag: &str, build_id: &str) -> String {
    format!(
        "{}/api/json?tree={}",
        build_base_url(server, lane_tag, build_id),
        METADATA_TREE
    )
}

/// Failure report for one build, via the artifact download proxy
pub fn report_url(server: &str, lane_tag: &str, build_id: &str) -> String {
    format!(
        "{}/Azure/processDownloadRequest/{}/{}/{}",
        build_base_url(server, lane_tag, build_id),
        lane_tag,
        build_id,
        REPORT_ARTIFACT
    )
}

// =============================================================================
// Payload Shapes
// =============================================================================

/// Response of the lane index endpoint
#[derive(Debug, Deserialize)]
pub struct LaneIndex {
    /// Builds newest-first, as Jenkins reports them
    #[serde(default)]
    pub builds: Vec<BuildRef>,
}

/// One entry of the lane index
#[derive(Debug, Deserialize)]
pub struct BuildRef {
    pub number: u64,
}

impl LaneIndex {
    /// Parse the lane index payload
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// The build-metadata fields the pipeline itself needs. Record-specific
/// fields (PR parameters, git revisions) stay in the raw `Value` handed to
/// the interpret hook.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildMetadata {
    /// Build start time, epoch milliseconds
    #[serde(default)]
    pub timestamp: i64,
    /// Whether the build is still running
    #[serde(default)]
    pub building: bool,
    /// Terminal result string ("SUCCESS", "UNSTABLE", ...), absent while the
    /// result is not yet recorded
    #[serde(default)]
    pub result: Option<String>,
}

impl BuildMetadata {
    /// Extract the pipeline-relevant fields from a parsed metadata payload
    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    /// A build is complete once it stopped running and has a recorded result
    pub fn is_complete(&self) -> bool {
        !self.building && self.result.is_some()
    }
}

/// Parse a json-lines payload (one JSON value per non-blank line)
pub fn json_lines(text: &str) -> Result<Vec<Value>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| Error::MalformedPayload(format!("bad json-lines row: {e}")))
        })
        .collect()
}
