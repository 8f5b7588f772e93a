//! Build Records
//!
//! Per-build data holders: network status flags, the completeness state that
//! gates the report fetch, and the extension hooks through which concrete
//! record types pull their fields out of the server payloads.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::jenkins::BuildMetadata;

/// Repos whose git `BuildData` actions describe the code under test. Lanes
/// also attach auxiliary repos (conformance suites) whose revisions are
/// noise; a build's hash is taken only from an action pointing at one of
/// these remotes. Historical remote URLs count — a branch of the main repo
/// is good enough.
const PRIMARY_REPO_URLS: &[&str] = &[
    "git://github.com/mono/mono.git",
    "https://github.com/mono/mono",
];

// =============================================================================
// Status
// =============================================================================

/// Outcome flags for one fetch attempt. `failed` implies `loaded`; once
/// `loaded` is set it never reverts — a reload replaces the whole record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    pub loaded: bool,
    pub failed: bool,
}

impl Status {
    /// Fresh, not-yet-attempted status
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the attempt finished successfully (unless already failed)
    pub fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    /// Mark the attempt finished and failed
    pub fn mark_failed(&mut self) {
        self.loaded = true;
        self.failed = true;
    }
}

// =============================================================================
// Build Record
// =============================================================================

/// State common to every build record, independent of what the concrete
/// record type parses out of the payloads.
#[derive(Debug, Clone)]
pub struct BuildState {
    /// Build number, scoped to the owning lane
    pub id: String,
    /// Link to the human-readable page for this build
    pub display_url: String,
    /// Status of the metadata fetch
    pub metadata_status: Status,
    /// Status of the failure-report fetch
    pub report_status: Status,
    /// True once metadata showed a terminal result and no in-progress flag
    pub complete: bool,
}

impl BuildState {
    /// New record state for a build we have not fetched anything about
    pub fn new(id: &str, display_url: String) -> Self {
        Self {
            id: id.to_string(),
            display_url,
            metadata_status: Status::new(),
            report_status: Status::new(),
            complete: false,
        }
    }

    /// Whether this record has finished loading for the current cycle.
    /// The report is only awaited when it will actually be fetched: metadata
    /// succeeded, reports are enabled, and the build is complete.
    pub fn loaded(&self, fetch_reports: bool) -> bool {
        self.metadata_status.loaded
            && (self.metadata_status.failed
                || !fetch_reports
                || !self.complete
                || self.report_status.loaded)
    }

    /// Whether either fetch failed
    pub fn failed(&self) -> bool {
        self.metadata_status.failed || self.report_status.failed
    }
}

/// Capability interface for concrete build-record types. The lane drives the
/// fetch pipeline through this trait and stays agnostic of which fields a
/// record extracts.
pub trait BuildRecord: Send + Sync {
    /// Construct a fresh record for a build id
    fn new(id: &str, display_url: String) -> Self
    where
        Self: Sized;

    /// Shared pipeline state
    fn state(&self) -> &BuildState;

    /// Shared pipeline state, mutable
    fn state_mut(&mut self) -> &mut BuildState;

    /// Pull record fields out of the parsed metadata payload. An error marks
    /// the metadata status failed and prevents the payload from being cached.
    fn interpret_metadata(&mut self, metadata: &Value) -> Result<()>;

    /// Pull record fields out of the parsed failure-report rows
    fn interpret_report(&mut self, records: &[Value]) -> Result<()>;

    /// Build number
    fn id(&self) -> &str {
        &self.state().id
    }

    /// True once metadata said the build finished
    fn complete(&self) -> bool {
        self.state().complete
    }

    /// See [`BuildState::loaded`]
    fn loaded(&self, fetch_reports: bool) -> bool {
        self.state().loaded(fetch_reports)
    }

    /// See [`BuildState::failed`]
    fn failed(&self) -> bool {
        self.state().failed()
    }
}

// =============================================================================
// Failures
// =============================================================================

/// Classification of a single failure found in the report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Failed while building, not while testing
    Build,
    /// Ordinary testcase failure
    Test,
    /// Testcase crashed the harness
    Crash,
    /// Testcase or step timed out
    Hang,
    /// Report gave no usable classification
    Unknown,
}

impl FailureKind {
    /// Short human-readable label
    pub fn describe(&self) -> &'static str {
        match self {
            FailureKind::Build => "Build failure",
            FailureKind::Test => "Testcase failure",
            FailureKind::Crash => "Crash",
            FailureKind::Hang => "Hang",
            FailureKind::Unknown => "Unknown failure",
        }
    }
}

/// One failure of one test (or one whole step) in one build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// The invocation (step command line) that failed
    pub step: String,
    /// Failing test name; `None` when the step failed as a whole
    pub test: Option<String>,
    pub kind: FailureKind,
}

impl Failure {
    /// New failure with the step normalized (PR lanes append a `CI_PR=<n>`
    /// parameter to step strings; strip it so steps match across lanes)
    pub fn new(step: &str, test: Option<&str>) -> Self {
        Self {
            step: sanitize_step(step),
            test: test.map(str::to_string),
            kind: FailureKind::Unknown,
        }
    }

    /// Stable key for grouping identical failures across builds
    pub fn key(&self) -> String {
        match &self.test {
            Some(test) => format!("{}{}", self.step, test),
            None => self.step.clone(),
        }
    }

    /// True if this failure occurred during build rather than during test
    pub fn is_build_failure(&self) -> bool {
        self.step.starts_with("./autogen.sh")
            || self.step.contains("MSBuild.exe")
            || is_make_invocation(&self.step)
    }
}

/// Strip a trailing ` CI_PR=<digits>` from a step string
fn sanitize_step(step: &str) -> String {
    let trimmed = step.trim_end();
    if let Some(head) = trimmed.rfind(" CI_PR=").map(|i| &trimmed[..i]) {
        let tail = &trimmed[head.len() + " CI_PR=".len()..];
        if tail.chars().all(|c| c.is_ascii_digit()) {
            return head.trim_end().to_string();
        }
    }
    step.to_string()
}

/// Matches `make -w V=1` with an optional `-jN` between, anywhere in the step
fn is_make_invocation(step: &str) -> bool {
    let mut rest = step;
    while let Some(pos) = rest.find("make ") {
        let mut tail = &rest[pos + "make ".len()..];
        if let Some(after_j) = tail.strip_prefix("-j") {
            let digits = after_j.len() - after_j.trim_start_matches(|c: char| c.is_ascii_digit()).len();
            if digits > 0 {
                if let Some(stripped) = after_j[digits..].strip_prefix(' ') {
                    tail = stripped;
                }
            }
        }
        if tail.starts_with("-w V=1") {
            return true;
        }
        rest = &rest[pos + "make ".len()..];
    }
    false
}

// =============================================================================
// Standard Build
// =============================================================================

/// The concrete record type the dashboard views consume: date/result/commit
/// identity from the metadata, plus the parsed failure list from the report.
#[derive(Debug, Clone)]
pub struct StandardBuild {
    state: BuildState,
    /// Build start time
    pub date: Option<DateTime<Utc>>,
    /// Terminal result string, absent while in progress
    pub result: Option<String>,
    /// In-progress flag as last reported
    pub building: bool,
    /// Commit under test (the PR head commit on PR lanes)
    pub git_hash: Option<String>,
    /// Pull request number, PR lanes only
    pub pr_id: Option<String>,
    /// Pull request page
    pub pr_url: Option<String>,
    /// Pull request title
    pub pr_title: Option<String>,
    /// Failures parsed from the report, in report order
    pub failures: Vec<Failure>,
}

impl StandardBuild {
    /// "In progress" also covers the window where the build stopped but the
    /// result has not been recorded yet (artifacts still uploading).
    pub fn in_progress(&self) -> bool {
        self.building || self.result.is_none()
    }

    /// Result string for display
    pub fn result_string(&self) -> &str {
        match &self.result {
            None => "(In progress)",
            Some(_) if self.in_progress() => "(Uploading)",
            Some(result) => result,
        }
    }

    /// Commit identity for grouping builds across lanes: PR builds group by
    /// PR id + head commit, mainline builds by commit alone.
    pub fn build_tag(&self) -> Option<String> {
        match (&self.pr_id, &self.git_hash) {
            (Some(pr), Some(hash)) => Some(format!("{pr}{hash}")),
            (Some(pr), None) => Some(pr.clone()),
            (None, Some(hash)) => Some(hash.clone()),
            (None, None) => None, // lane is misconfigured
        }
    }

    /// Abbreviated commit hash for display
    pub fn git_display(&self) -> String {
        match &self.git_hash {
            Some(hash) => hash.chars().take(6).collect(),
            None => "[UNKNOWN]".to_string(),
        }
    }

    /// Page describing the commit under test
    pub fn commit_url(&self) -> String {
        if let Some(pr_url) = &self.pr_url {
            return pr_url.clone();
        }
        match &self.git_hash {
            Some(hash) => format!("{}/commit/{}", PRIMARY_REPO_URLS[1], hash),
            None => PRIMARY_REPO_URLS[1].to_string(),
        }
    }
}

/// True when any remote URL of a git BuildData action points at the primary
/// repo (historical URLs included)
fn remote_matches_primary(remote_urls: &Value) -> bool {
    remote_urls
        .as_array()
        .map(|urls| {
            urls.iter()
                .filter_map(Value::as_str)
                .any(|url| PRIMARY_REPO_URLS.contains(&url))
        })
        .unwrap_or(false)
}

fn truthy_code(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Number(n) => {
            if n.as_i64() == Some(0) {
                None
            } else {
                Some(n.to_string())
            }
        }
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn flag_set(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() != Some(0),
        Some(Value::String(s)) => !s.is_empty(),
        _ => false,
    }
}

impl BuildRecord for StandardBuild {
    fn new(id: &str, display_url: String) -> Self {
        Self {
            state: BuildState::new(id, display_url),
            date: None,
            result: None,
            building: false,
            git_hash: None,
            pr_id: None,
            pr_url: None,
            pr_title: None,
            failures: Vec::new(),
        }
    }

    fn state(&self) -> &BuildState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut BuildState {
        &mut self.state
    }

    fn interpret_metadata(&mut self, metadata: &Value) -> Result<()> {
        let typed = BuildMetadata::from_value(metadata)?;
        self.date = Utc.timestamp_millis_opt(typed.timestamp).single();
        self.result = typed.result;
        self.building = typed.building;

        let mut pr_hash: Option<String> = None;
        let mut repo_hash: Option<String> = None;

        for action in metadata["actions"].as_array().into_iter().flatten() {
            match action["_class"].as_str() {
                Some("hudson.model.ParametersAction") => {
                    for param in action["parameters"].as_array().into_iter().flatten() {
                        let value = param["value"].as_str();
                        match param["name"].as_str() {
                            Some("ghprbPullId") => self.pr_id = value.map(str::to_string),
                            Some("ghprbPullLink") => self.pr_url = value.map(str::to_string),
                            Some("ghprbPullTitle") => self.pr_title = value.map(str::to_string),
                            Some("ghprbActualCommit") => pr_hash = value.map(str::to_string),
                            _ => {}
                        }
                    }
                }
                Some("hudson.plugins.git.util.BuildData") => {
                    if remote_matches_primary(&action["remoteUrls"]) {
                        if let Some(sha) = action["lastBuiltRevision"]["SHA1"].as_str() {
                            repo_hash = Some(sha.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        // On a PR lane the parameter carries the commit that triggered the
        // build; the last built revision is a temporary merge commit that is
        // often not even reported.
        self.git_hash = pr_hash.or(repo_hash);
        Ok(())
    }

    fn interpret_report(&mut self, records: &[Value]) -> Result<()> {
        for record in records {
            let Some(code) = truthy_code(record.get("final_code")) else {
                continue;
            };
            let step = record["invocation"].as_str().unwrap_or_default();
            let mut resolved = false;

            if flag_set(record.get("babysitter_protocol")) || flag_set(record.get("loaded_xml")) {
                for (test_name, test) in record["tests"].as_object().into_iter().flatten() {
                    let mut failure = Failure::new(step, Some(test_name.as_str()));
                    failure.kind = if flag_set(test.get("crash_failures")) {
                        FailureKind::Crash
                    } else if flag_set(test.get("timeout_failures")) {
                        FailureKind::Hang
                    } else if flag_set(test.get("normal_failures")) {
                        FailureKind::Test
                    } else {
                        FailureKind::Unknown
                    };
                    self.failures.push(failure);
                    resolved = true;
                }
            }

            if !resolved {
                let mut failure = Failure::new(step, None);
                if code == "124" {
                    // GNU timeout exit code
                    failure.kind = FailureKind::Hang;
                } else if failure.is_build_failure() {
                    failure.kind = FailureKind::Build;
                }
                self.failures.push(failure);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fresh() -> StandardBuild {
        StandardBuild::new("100", "https://ci.example.com/job/lane/100".into())
    }

    #[test]
    fn test_status_transitions() {
        let mut status = Status::new();
        assert!(!status.loaded && !status.failed);

        status.mark_loaded();
        assert!(status.loaded && !status.failed);

        status.mark_failed();
        assert!(status.loaded && status.failed);
    }

    #[test]
    fn test_loaded_gating() {
        let mut build = fresh();
        assert!(!build.loaded(true));

        // Metadata loaded, build incomplete: nothing more will be fetched
        // this cycle, so the record counts as loaded.
        build.state_mut().metadata_status.mark_loaded();
        assert!(build.loaded(true));

        // Once complete, the report is awaited...
        build.state_mut().complete = true;
        assert!(!build.loaded(true));
        // ...unless report fetching is disabled...
        assert!(build.loaded(false));
        // ...or the metadata fetch failed (short-circuits the report).
        build.state_mut().metadata_status.mark_failed();
        assert!(build.loaded(true));
    }

    #[test]
    fn test_failed_is_either_status() {
        let mut build = fresh();
        assert!(!build.failed());
        build.state_mut().report_status.mark_failed();
        assert!(build.failed());
    }

    #[test]
    fn test_interpret_metadata_mainline() {
        let mut build = fresh();
        build
            .interpret_metadata(&json!({
                "timestamp": 1_500_000_000_000_i64,
                "building": false,
                "result": "SUCCESS",
                "actions": [
                    {
                        "_class": "hudson.plugins.git.util.BuildData",
                        "lastBuiltRevision": {"SHA1": "aux0000"},
                        "remoteUrls": ["https://github.com/example/conformance-suite"]
                    },
                    {
                        "_class": "hudson.plugins.git.util.BuildData",
                        "lastBuiltRevision": {"SHA1": "abc123def456"},
                        "remoteUrls": ["https://github.com/mono/mono"]
                    }
                ]
            }))
            .unwrap();

        assert_eq!(build.result.as_deref(), Some("SUCCESS"));
        assert!(!build.in_progress());
        // The auxiliary repo's revision must not win.
        assert_eq!(build.git_hash.as_deref(), Some("abc123def456"));
        assert_eq!(build.git_display(), "abc123");
        assert!(build.date.is_some());
    }

    #[test]
    fn test_interpret_metadata_pr_parameters_override_revision() {
        let mut build = fresh();
        build
            .interpret_metadata(&json!({
                "timestamp": 1_500_000_000_000_i64,
                "building": false,
                "result": "FAILURE",
                "actions": [
                    {
                        "_class": "hudson.model.ParametersAction",
                        "parameters": [
                            {"name": "ghprbPullId", "value": "4242"},
                            {"name": "ghprbPullLink", "value": "https://github.com/mono/mono/pull/4242"},
                            {"name": "ghprbPullTitle", "value": "Fix the thing"},
                            {"name": "ghprbActualCommit", "value": "feedface"}
                        ]
                    },
                    {
                        "_class": "hudson.plugins.git.util.BuildData",
                        "lastBuiltRevision": {"SHA1": "mergecommit"},
                        "remoteUrls": ["https://github.com/mono/mono"]
                    }
                ]
            }))
            .unwrap();

        assert_eq!(build.pr_id.as_deref(), Some("4242"));
        assert_eq!(build.pr_title.as_deref(), Some("Fix the thing"));
        assert_eq!(build.git_hash.as_deref(), Some("feedface"));
        assert_eq!(build.build_tag().unwrap(), "4242feedface");
        assert_eq!(build.commit_url(), "https://github.com/mono/mono/pull/4242");
    }

    #[test]
    fn test_interpret_metadata_without_actions() {
        let mut build = fresh();
        build
            .interpret_metadata(&json!({
                "timestamp": 1_500_000_000_000_i64,
                "building": true
            }))
            .unwrap();

        assert!(build.in_progress());
        assert_eq!(build.result_string(), "(In progress)");
        assert!(build.git_hash.is_none());
        assert!(build.build_tag().is_none());
    }

    #[test]
    fn test_result_string_uploading_window() {
        let mut build = fresh();
        build
            .interpret_metadata(&json!({
                "timestamp": 1_500_000_000_000_i64,
                "building": true,
                "result": "SUCCESS"
            }))
            .unwrap();
        assert_eq!(build.result_string(), "(Uploading)");
    }

    #[test]
    fn test_interpret_report_per_test_failures() {
        let mut build = fresh();
        build
            .interpret_report(&[json!({
                "final_code": 1,
                "invocation": "make -w -C mcs/class/corlib run-test",
                "babysitter_protocol": true,
                "tests": {
                    "MonoTests.System.DateTimeTest:TestParse": {"normal_failures": 1},
                    "MonoTests.System.Threading.ThreadTest:TestAbort": {"crash_failures": 1},
                    "MonoTests.System.Net.WebClientTest:TestTimeout": {"timeout_failures": 1}
                }
            })])
            .unwrap();

        assert_eq!(build.failures.len(), 3);
        let kind_of = |test: &str| {
            build
                .failures
                .iter()
                .find(|f| f.test.as_deref() == Some(test))
                .unwrap()
                .kind
        };
        assert_eq!(kind_of("MonoTests.System.DateTimeTest:TestParse"), FailureKind::Test);
        assert_eq!(
            kind_of("MonoTests.System.Threading.ThreadTest:TestAbort"),
            FailureKind::Crash
        );
        assert_eq!(
            kind_of("MonoTests.System.Net.WebClientTest:TestTimeout"),
            FailureKind::Hang
        );
    }

    #[test]
    fn test_interpret_report_unresolved_step_failures() {
        let mut build = fresh();
        build
            .interpret_report(&[
                json!({"final_code": "124", "invocation": "make -w V=1 all"}),
                json!({"final_code": 2, "invocation": "./autogen.sh --enable-checks"}),
                json!({"final_code": 1, "invocation": "some-custom-step"}),
                json!({"final_code": 0, "invocation": "succeeded-step"}),
            ])
            .unwrap();

        assert_eq!(build.failures.len(), 3);
        assert_eq!(build.failures[0].kind, FailureKind::Hang);
        assert_eq!(build.failures[1].kind, FailureKind::Build);
        assert_eq!(build.failures[2].kind, FailureKind::Unknown);
    }

    #[test]
    fn test_step_sanitizer_strips_pr_parameter() {
        let failure = Failure::new("make -w check CI_PR=1234", None);
        assert_eq!(failure.step, "make -w check");

        // Bare CI_PR= with no digits is also produced by some lanes.
        let failure = Failure::new("make -w check CI_PR=", None);
        assert_eq!(failure.step, "make -w check");

        let untouched = Failure::new("make -w check CI_PR=abc", None);
        assert_eq!(untouched.step, "make -w check CI_PR=abc");
    }

    #[test]
    fn test_build_failure_heuristic() {
        assert!(Failure::new("./autogen.sh --enable", None).is_build_failure());
        assert!(Failure::new("bash -c make -w V=1 -C mono", None).is_build_failure());
        assert!(Failure::new("make -j4 -w V=1", None).is_build_failure());
        assert!(Failure::new("cmd /c MSBuild.exe mono.sln", None).is_build_failure());
        assert!(!Failure::new("make -w -C mcs/class/System run-test", None).is_build_failure());
    }

    #[test]
    fn test_failure_key_groups_step_and_test() {
        let a = Failure::new("step", Some("test"));
        let b = Failure::new("step", None);
        assert_eq!(a.key(), "steptest");
        assert_eq!(b.key(), "step");
    }
}
