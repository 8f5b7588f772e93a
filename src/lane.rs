//! Lane Polling
//!
//! A lane is one CI job column: a named job URL plus the set of recent builds
//! observed under it. `Lane::load` runs one poll pass:
//!
//! ```text
//!   lane index (uncached)
//!        |
//!        v  per build, newest first, capped
//!   metadata fetch ---- incomplete ----> done (re-polled next pass)
//!        |
//!        v  complete, reports enabled
//!   known-404 marker? --- yes --------> done (never re-fetched)
//!        |
//!        v
//!   report fetch ------- 404 ---------> write marker, done
//!        |
//!        v
//!   interpret + cache under the build's timestamp
//! ```
//!
//! Builds already known complete are never re-queried; their cached payloads
//! were interpreted when first seen and the records are kept in memory.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::build::{BuildRecord, Status};
use crate::cache::group_key;
use crate::config::{LaneVisibility, PollerConfig};
use crate::fetch::{CacheVerdict, FetchDisposition, FetchOrchestrator, Transport};
use crate::jenkins::{
    self, build_api_url, build_base_url, lane_api_url, lane_base_url, report_url, BuildMetadata,
    LaneIndex,
};

/// Cache kind for raw build metadata JSON
pub const METADATA_KIND: &str = "metadata";

/// Cache kind for the raw failure-report body
pub const REPORT_KIND: &str = "report";

/// Cache kind marking a report permanently absent on the server
pub const REPORT_404_KIND: &str = "report404";

// =============================================================================
// Lane
// =============================================================================

/// One CI job being polled, with its in-memory build records
pub struct Lane<B: BuildRecord> {
    /// Human-readable column name, e.g. "Linux Intel64 (PR)"
    pub name: String,
    /// Job path on the server, e.g. "test-mono-pull-request-amd64"
    pub tag: String,
    /// Whether this lane builds pull requests rather than mainline commits
    pub is_pr: bool,
    /// Whether the job runs on every commit (established by a PR twin existing)
    pub is_core: bool,
    /// Link to the job's page
    pub display_url: String,
    /// JSON index endpoint for the job
    pub api_url: String,
    /// Outcome of the most recent poll of the lane index
    pub status: Status,
    /// True once any poll of this lane has succeeded
    pub ever_loaded: bool,
    /// Builds still being processed in the current poll
    pub builds_remaining: usize,
    build_map: HashMap<String, B>,
}

impl<B: BuildRecord> Lane<B> {
    pub fn new(server: &str, name: &str, tag: &str, is_pr: bool, is_core: bool) -> Self {
        Self {
            name: name.to_string(),
            tag: tag.to_string(),
            is_pr,
            is_core,
            display_url: lane_base_url(server, tag),
            api_url: lane_api_url(server, tag),
            status: Status::new(),
            ever_loaded: false,
            builds_remaining: 0,
            build_map: HashMap::new(),
        }
    }

    /// All build records currently held, in no particular order
    pub fn builds(&self) -> impl Iterator<Item = &B> {
        self.build_map.values()
    }

    /// A single build record by id
    pub fn build(&self, id: &str) -> Option<&B> {
        self.build_map.get(id)
    }

    /// Whether the lane has anything worth displaying
    pub fn visible(&self) -> bool {
        self.status.loaded || self.ever_loaded
    }

    /// Run one poll pass over this lane.
    ///
    /// Safe to call repeatedly: completed builds are skipped, incomplete ones
    /// are re-fetched with fresh records, and all cacheable payloads go
    /// through the orchestrator.
    pub async fn load<T: Transport>(
        &mut self,
        orchestrator: &FetchOrchestrator<T>,
        config: &PollerConfig,
    ) {
        debug!(lane = %self.tag, url = %self.api_url, "Polling lane");

        let index_body = match orchestrator.fetch_uncached(&self.api_url).await {
            Ok(body) => body,
            Err(e) => {
                warn!(lane = %self.tag, url = %self.api_url, error = %e, "Failed to load lane index");
                self.status.mark_failed();
                orchestrator.signal().mark();
                return;
            }
        };

        let index = match LaneIndex::parse(&index_body) {
            Ok(index) => index,
            Err(e) => {
                warn!(lane = %self.tag, error = %e, "Malformed lane index");
                self.status.mark_failed();
                orchestrator.signal().mark();
                return;
            }
        };

        self.status.mark_loaded();
        self.ever_loaded = true;
        self.builds_remaining = index.builds.len().min(config.max_build_queries);

        let mut queries = 0;
        for build_ref in &index.builds {
            let build_id = build_ref.number.to_string();

            if self
                .build_map
                .get(&build_id)
                .map(|b| b.complete())
                .unwrap_or(false)
            {
                self.builds_remaining = self.builds_remaining.saturating_sub(1);
            } else {
                self.process_build(orchestrator, config, &build_id).await;
            }

            queries += 1;
            if queries >= config.max_build_queries {
                break;
            }
        }

        orchestrator.signal().mark();
    }

    /// Fetch and interpret one build: metadata always, report when the build
    /// is complete and reports are enabled.
    async fn process_build<T: Transport>(
        &mut self,
        orchestrator: &FetchOrchestrator<T>,
        config: &PollerConfig,
        build_id: &str,
    ) {
        let group = group_key(build_id, &self.tag);
        let mut build = B::new(build_id, build_base_url(&config.server, &self.tag, build_id));
        let mut timestamp = None;

        let metadata_url = build_api_url(&config.server, &self.tag, build_id);
        let disposition = orchestrator
            .fetch(&group, METADATA_KIND, &metadata_url, |text| {
                let json: serde_json::Value = serde_json::from_str(text)?;
                let metadata = BuildMetadata::from_value(&json)?;
                build.state_mut().complete = metadata.is_complete();
                build.interpret_metadata(&json)?;
                if metadata.is_complete() {
                    timestamp = Some(metadata.timestamp);
                    Ok(CacheVerdict::Store {
                        timestamp: metadata.timestamp,
                    })
                } else {
                    Ok(CacheVerdict::Skip)
                }
            })
            .await;
        disposition.apply_to(&mut build.state_mut().metadata_status);

        if disposition.is_failure() || !config.fetch_reports || !build.complete() {
            self.builds_remaining = self.builds_remaining.saturating_sub(1);
            self.build_map.insert(build_id.to_string(), build);
            return;
        }

        // A complete build joins the eviction order even when its report
        // never materializes. Idempotent for cache hits.
        if let Some(ts) = timestamp {
            orchestrator.context().register_group(ts, &group);
        }

        if orchestrator.context().has_marker(&group, REPORT_404_KIND) {
            build.state_mut().report_status.mark_failed();
            self.builds_remaining = self.builds_remaining.saturating_sub(1);
            self.build_map.insert(build_id.to_string(), build);
            return;
        }

        let url = report_url(&config.server, &self.tag, build_id);
        let disposition = orchestrator
            .fetch(&group, REPORT_KIND, &url, |text| {
                let rows = jenkins::json_lines(text)?;
                build.interpret_report(&rows)?;
                match timestamp {
                    Some(ts) => Ok(CacheVerdict::Store { timestamp: ts }),
                    None => Ok(CacheVerdict::Skip),
                }
            })
            .await;
        disposition.apply_to(&mut build.state_mut().report_status);

        // A 404 is permanent: the artifact was never archived for this build.
        // Other failure modes stay uncached and are retried next poll.
        if let FetchDisposition::TransportFailed {
            http_status: Some(404),
        } = disposition
        {
            orchestrator.context().set_marker(&group, REPORT_404_KIND);
        }

        self.builds_remaining = self.builds_remaining.saturating_sub(1);
        self.build_map.insert(build_id.to_string(), build);
    }
}

// =============================================================================
// Lane tables
// =============================================================================

/// Name, mainline job tag, optional PR job tag. A PR twin existing marks the
/// architecture as core (built on every commit).
type LaneSpec = (&'static str, &'static str, Option<&'static str>);

const CORE_LANE_SPECS: &[LaneSpec] = &[
    ("Mac Intel64", "test-mono-mainline/label=osx-amd64", Some("test-mono-pull-request-amd64-osx")),
    ("Mac Intel32", "test-mono-mainline/label=osx-i386", Some("test-mono-pull-request-i386-osx")),
    ("Linux Intel64", "test-mono-mainline-linux/label=ubuntu-1404-amd64", Some("test-mono-pull-request-amd64")),
    ("Linux Intel32", "test-mono-mainline-linux/label=ubuntu-1404-i386", Some("test-mono-pull-request-i386")),
    ("Linux ARM64", "test-mono-mainline-linux/label=debian-8-arm64", Some("test-mono-pull-request-arm64")),
    ("Linux ARM32-hf", "test-mono-mainline-linux/label=debian-8-armhf", Some("test-mono-pull-request-armhf")),
    ("Linux ARM32-el", "test-mono-mainline-linux/label=debian-8-armel", Some("test-mono-pull-request-armel")),
];

// The non-core tiers are nightly rather than per-commit, except Windows.
const EXTENDED_LANE_SPECS: &[LaneSpec] = &[
    ("Windows Intel32", "z/label=w32", Some("w")),
    ("Windows Intel64", "z/label=w64", Some("x")),
    ("Linux Intel32 Coop", "test-mono-mainline-coop/label=ubuntu-1404-i386", None),
    ("Linux Intel64 Coop", "test-mono-mainline-coop/label=ubuntu-1404-amd64", None),
    ("Linux Intel32 FullAOT", "test-mono-mainline-mobile_static/label=ubuntu-1404-i386", None),
    ("Linux Intel64 FullAOT", "test-mono-mainline-mobile_static/label=ubuntu-1404-amd64", None),
    ("Linux ARM64 FullAOT", "test-mono-mainline-mobile_static/label=debian-8-arm64", None),
    ("Linux ARM32-hf FullAOT", "test-mono-mainline-mobile_static/label=debian-8-armhf", None),
    ("Linux ARM32-el FullAOT", "test-mono-mainline-mobile_static/label=debian-8-armel", None),
    ("Linux Intel64 Bitcode", "test-mono-mainline-bitcode/label=ubuntu-1404-amd64", None),
    ("Linux Intel64 Checked", "test-mono-mainline-checked/label=ubuntu-1404-amd64", None),
];

const VALGRIND_LANE_SPECS: &[LaneSpec] = &[(
    "Linux Intel64 Bitcode Valgrind",
    "test-mono-mainline-bitcode-valgrind/label=ubuntu-1404-amd64",
    None,
)];

fn extend_lanes<B: BuildRecord>(
    lanes: &mut Vec<Lane<B>>,
    config: &PollerConfig,
    specs: &[LaneSpec],
) {
    for (name, tag, pr_tag) in specs {
        let is_core = pr_tag.is_some();
        lanes.push(Lane::new(&config.server, name, tag, false, is_core));
        if config.allow_pr {
            if let Some(pr_tag) = pr_tag {
                let pr_name = format!("{name} (PR)");
                lanes.push(Lane::new(&config.server, &pr_name, pr_tag, true, is_core));
            }
        }
    }
}

/// Construct the lane set for a configuration's visibility tier
pub fn make_lanes<B: BuildRecord>(config: &PollerConfig) -> Vec<Lane<B>> {
    let mut lanes = Vec::new();
    extend_lanes(&mut lanes, config, CORE_LANE_SPECS);
    if config.visibility >= LaneVisibility::Extended {
        extend_lanes(&mut lanes, config, EXTENDED_LANE_SPECS);
    }
    if config.visibility >= LaneVisibility::Full {
        extend_lanes(&mut lanes, config, VALGRIND_LANE_SPECS);
    }
    lanes
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::StandardBuild;
    use crate::cache::{CacheContext, MemoryBackend};
    use crate::fetch::MockTransport;
    use crate::signal::ChangeSignal;
    use std::sync::Arc;

    fn test_config() -> PollerConfig {
        PollerConfig {
            server: "https://ci.example.com".to_string(),
            ..PollerConfig::default()
        }
    }

    fn orchestrator() -> FetchOrchestrator<MockTransport> {
        let ctx = Arc::new(
            CacheContext::open(Arc::new(MemoryBackend::new()), "test!", 1_000_000).unwrap(),
        );
        FetchOrchestrator::new(ctx, MockTransport::new(), ChangeSignal::new())
    }

    fn index_body(numbers: &[u64]) -> String {
        let builds: Vec<String> = numbers.iter().map(|n| format!("{{\"number\":{n}}}")).collect();
        format!("{{\"builds\":[{}]}}", builds.join(","))
    }

    fn complete_metadata(timestamp: i64) -> String {
        format!(
            "{{\"timestamp\":{timestamp},\"building\":false,\"result\":\"SUCCESS\",\"actions\":[]}}"
        )
    }

    #[test]
    fn test_make_lanes_core_tier() {
        let config = test_config();
        let lanes: Vec<Lane<StandardBuild>> = make_lanes(&config);
        assert_eq!(lanes.len(), 14, "7 mainline lanes plus 7 PR twins");
        assert!(lanes.iter().all(|l| l.is_core));
        assert_eq!(lanes.iter().filter(|l| l.is_pr).count(), 7);
        assert!(lanes
            .iter()
            .any(|l| l.name == "Linux Intel64 (PR)" && l.tag == "test-mono-pull-request-amd64"));
    }

    #[test]
    fn test_make_lanes_without_pr() {
        let config = PollerConfig {
            allow_pr: false,
            ..test_config()
        };
        let lanes: Vec<Lane<StandardBuild>> = make_lanes(&config);
        assert_eq!(lanes.len(), 7);
        assert!(lanes.iter().all(|l| !l.is_pr));
    }

    #[test]
    fn test_make_lanes_tiers() {
        let extended = PollerConfig {
            visibility: LaneVisibility::Extended,
            ..test_config()
        };
        let full = PollerConfig {
            visibility: LaneVisibility::Full,
            ..test_config()
        };
        let extended_lanes: Vec<Lane<StandardBuild>> = make_lanes(&extended);
        let full_lanes: Vec<Lane<StandardBuild>> = make_lanes(&full);
        // 14 core + 2 Windows pairs + 9 nightly singles
        assert_eq!(extended_lanes.len(), 27);
        assert_eq!(full_lanes.len(), 28);
        assert!(!full_lanes.last().unwrap().is_core);
    }

    #[tokio::test]
    async fn test_lane_index_failure_marks_lane_failed() {
        let orch = orchestrator();
        let config = test_config();
        let mut lane: Lane<StandardBuild> =
            Lane::new(&config.server, "Linux Intel64", "test-lane", false, true);
        // No scripted response: the index GET answers 404.
        lane.load(&orch, &config).await;
        assert!(lane.status.loaded && lane.status.failed);
        assert!(!lane.ever_loaded);
        assert!(lane.visible());
    }

    #[tokio::test]
    async fn test_incomplete_build_fetches_no_report() {
        let orch = orchestrator();
        let config = test_config();
        let mut lane: Lane<StandardBuild> =
            Lane::new(&config.server, "Linux Intel64", "test-lane", false, true);

        orch.transport().insert(&lane.api_url, &index_body(&[7]));
        orch.transport().insert(
            &build_api_url(&config.server, "test-lane", "7"),
            "{\"timestamp\":1000,\"building\":true,\"actions\":[]}",
        );

        lane.load(&orch, &config).await;

        let build = lane.build("7").unwrap();
        assert!(build.state().metadata_status.loaded);
        assert!(!build.complete());
        assert!(!build.state().report_status.loaded);
        assert_eq!(lane.builds_remaining, 0);
        // Incomplete metadata is never cached, so nothing joined the queue.
        assert_eq!(orch.context().evictable_groups(), 0);
        let report = report_url(&config.server, "test-lane", "7");
        assert_eq!(orch.transport().request_count(&report), 0);
    }

    #[tokio::test]
    async fn test_complete_build_skipped_on_reload() {
        let orch = orchestrator();
        let config = test_config();
        let mut lane: Lane<StandardBuild> =
            Lane::new(&config.server, "Linux Intel64", "test-lane", false, true);

        let metadata_url = build_api_url(&config.server, "test-lane", "7");
        let report = report_url(&config.server, "test-lane", "7");
        orch.transport().insert(&lane.api_url, &index_body(&[7]));
        orch.transport().insert(&metadata_url, &complete_metadata(5_000));
        orch.transport().insert(&report, "{\"final_code\":\"0\",\"invocation\":\"make check\"}\n");

        lane.load(&orch, &config).await;
        assert!(lane.build("7").unwrap().loaded(config.fetch_reports));
        assert_eq!(orch.context().evictable_groups(), 1);

        lane.load(&orch, &config).await;
        assert_eq!(orch.transport().request_count(&metadata_url), 1, "complete build not re-queried");
        assert_eq!(orch.transport().request_count(&report), 1);
        assert_eq!(lane.builds_remaining, 0);
    }

    #[tokio::test]
    async fn test_report_404_marker_is_permanent() {
        let orch = orchestrator();
        let config = test_config();
        let metadata_url = build_api_url(&config.server, "test-lane", "9");
        let report = report_url(&config.server, "test-lane", "9");

        let mut lane: Lane<StandardBuild> =
            Lane::new(&config.server, "Linux Intel64", "test-lane", false, true);
        orch.transport().insert(&lane.api_url, &index_body(&[9]));
        orch.transport().insert(&metadata_url, &complete_metadata(5_000));
        orch.transport().insert_status(&report, 404);

        lane.load(&orch, &config).await;
        let build = lane.build("9").unwrap();
        assert!(build.state().report_status.failed);
        assert!(orch.context().has_marker("9!test-lane", REPORT_404_KIND));

        // A fresh lane over the same store trusts the marker and never
        // touches the report URL again.
        let mut fresh: Lane<StandardBuild> =
            Lane::new(&config.server, "Linux Intel64", "test-lane", false, true);
        fresh.load(&orch, &config).await;
        assert_eq!(orch.transport().request_count(&report), 1);
        assert!(fresh.build("9").unwrap().state().report_status.failed);
    }

    #[tokio::test]
    async fn test_max_build_queries_caps_poll() {
        let orch = orchestrator();
        let config = PollerConfig {
            max_build_queries: 2,
            fetch_reports: false,
            ..test_config()
        };
        let mut lane: Lane<StandardBuild> =
            Lane::new(&config.server, "Linux Intel64", "test-lane", false, true);

        orch.transport().insert(&lane.api_url, &index_body(&[4, 3, 2, 1]));
        for id in ["4", "3", "2", "1"] {
            orch.transport().insert(
                &build_api_url(&config.server, "test-lane", id),
                &complete_metadata(1_000),
            );
        }

        lane.load(&orch, &config).await;
        assert_eq!(lane.builds().count(), 2);
        assert!(lane.build("4").is_some());
        assert!(lane.build("3").is_some());
        assert!(lane.build("2").is_none());
        assert_eq!(lane.builds_remaining, 0);
    }
}
