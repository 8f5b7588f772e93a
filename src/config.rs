//! Poller Configuration
//!
//! Runtime knobs for the lane poller. Everything has a sensible default so
//! library users can start from [`PollerConfig::default`] and override the
//! handful of fields they care about; the binary layers CLI flags and
//! environment variables on top via clap.

use std::time::Duration;

use crate::cache::DEFAULT_CACHE_BUDGET;

/// Default CI server the lane tables refer to
pub const DEFAULT_SERVER: &str = "https://jenkins.mono-project.com";

/// Default per-poll cap on build metadata queries per lane
pub const DEFAULT_MAX_BUILD_QUERIES: usize = 50;

/// Default HTTP request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Which tiers of the lane table are polled
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LaneVisibility {
    /// The per-commit core lanes only
    Normal,
    /// Core plus the nightly and partial-check lanes
    Extended,
    /// Everything, including the valgrind lane
    Full,
}

impl LaneVisibility {
    /// Numeric level, matching the historical 1/2/3 convention
    pub fn level(&self) -> u8 {
        match self {
            LaneVisibility::Normal => 1,
            LaneVisibility::Extended => 2,
            LaneVisibility::Full => 3,
        }
    }

    pub fn from_level(level: u8) -> Self {
        match level {
            0 | 1 => LaneVisibility::Normal,
            2 => LaneVisibility::Extended,
            _ => LaneVisibility::Full,
        }
    }
}

/// Configuration for one poller instance
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Base URL of the CI server, no trailing slash required
    pub server: String,
    /// Lane tiers to poll
    pub visibility: LaneVisibility,
    /// Whether pull-request lanes are polled alongside their mainline twins
    pub allow_pr: bool,
    /// Whether per-build test reports are fetched for completed builds
    pub fetch_reports: bool,
    /// Cap on build metadata queries per lane per poll
    pub max_build_queries: usize,
    /// Cache budget in bytes of stored payload
    pub cache_budget: i64,
    /// HTTP request timeout
    pub request_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            visibility: LaneVisibility::Normal,
            allow_pr: true,
            fetch_reports: true,
            max_build_queries: DEFAULT_MAX_BUILD_QUERIES,
            cache_budget: DEFAULT_CACHE_BUDGET,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}
