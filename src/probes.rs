//! Artifact probe state feeding the tab visibility policy.

use tracing::warn;

use crate::error::FetchResult;
use crate::execution::Artifact;

/// Last known artifact listing for the open execution.
///
/// Until the first result arrives the probe counts as "loading", which
/// keeps the artifacts tab available. Once any result has come back, later
/// re-polls never count as loading. A failed probe keeps whatever listing
/// was last seen; with nothing seen yet the tab is hidden.
#[derive(Debug, Clone, Default)]
pub struct ArtifactProbe {
    listing: Option<Vec<Artifact>>,
    in_flight: bool,
    answered: bool,
}

impl ArtifactProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) {
        self.in_flight = true;
    }

    /// Record a probe result. Returns true when the artifact count changed.
    pub fn finish(&mut self, result: FetchResult<Vec<Artifact>>) -> bool {
        self.in_flight = false;
        self.answered = true;
        match result {
            Ok(artifacts) => {
                let before = self.listing.as_ref().map(Vec::len);
                let after = artifacts.len();
                self.listing = Some(artifacts);
                before != Some(after)
            }
            Err(e) => {
                warn!(error = %e, "artifact probe failed");
                false
            }
        }
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight && !self.answered && self.listing.is_none()
    }

    pub fn artifacts(&self) -> &[Artifact] {
        self.listing.as_deref().unwrap_or(&[])
    }

    pub fn has_artifacts_or_loading(&self) -> bool {
        self.is_loading() || !self.artifacts().is_empty()
    }
}
