//! Drawer sub-views: which tabs are legal, and which one is shown.
//!
//! Both functions here are pure and are evaluated from current inputs every
//! time the drawer is rendered. There is no stored "current tab" that has to
//! be reset when the execution changes; the tab the user picked is kept
//! together with the execution it was picked for, and is ignored as soon as
//! a different execution is open.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::execution::{ExecutionId, ExecutionStatus};

/// A drawer sub-view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TabId {
    #[default]
    Terminal,
    Artifacts,
    AiAnalysis,
}

impl TabId {
    pub const ALL: [TabId; 3] = [TabId::Terminal, TabId::Artifacts, TabId::AiAnalysis];

    pub fn as_str(self) -> &'static str {
        match self {
            TabId::Terminal => "terminal",
            TabId::Artifacts => "artifacts",
            TabId::AiAnalysis => "ai-analysis",
        }
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TabId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "terminal" => Ok(TabId::Terminal),
            "artifacts" => Ok(TabId::Artifacts),
            "ai-analysis" | "analysis" => Ok(TabId::AiAnalysis),
            other => Err(format!(
                "unknown tab '{other}' (expected terminal, artifacts or ai-analysis)"
            )),
        }
    }
}

/// The tabs that may be shown right now. `terminal` is always a member, so
/// the set is never empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleTabSet {
    artifacts: bool,
    ai_analysis: bool,
}

impl VisibleTabSet {
    /// Only the terminal.
    pub fn terminal_only() -> Self {
        Self {
            artifacts: false,
            ai_analysis: false,
        }
    }

    pub fn contains(&self, tab: TabId) -> bool {
        match tab {
            TabId::Terminal => true,
            TabId::Artifacts => self.artifacts,
            TabId::AiAnalysis => self.ai_analysis,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = TabId> + '_ {
        TabId::ALL.into_iter().filter(|tab| self.contains(*tab))
    }
}

impl fmt::Display for VisibleTabSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(TabId::as_str).collect();
        f.write_str(&names.join(", "))
    }
}

/// Compute the legal tab set.
///
/// - `terminal` always.
/// - `artifacts` while the first artifact probe is in flight or once at
///   least one artifact was found.
/// - `ai-analysis` unless the run hard-errored, or passed without analysis.
///   A passed run that does carry analysis keeps the tab.
pub fn visible_tabs(
    status: &ExecutionStatus,
    has_artifacts_or_loading: bool,
    has_analysis: bool,
) -> VisibleTabSet {
    let suppress_analysis = match status {
        ExecutionStatus::Error => true,
        ExecutionStatus::Passed => !has_analysis,
        _ => false,
    };
    VisibleTabSet {
        artifacts: has_artifacts_or_loading,
        ai_analysis: !suppress_analysis,
    }
}

/// The last tab the user explicitly picked and the execution it was picked
/// for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabOwnership {
    pub owner: Option<ExecutionId>,
    pub tab: TabId,
}

impl TabOwnership {
    pub fn new(owner: Option<ExecutionId>, tab: TabId) -> Self {
        Self { owner, tab }
    }

    /// The recorded tab, if it belongs to `current`.
    pub fn tab_for(&self, current: Option<&ExecutionId>) -> Option<TabId> {
        match (&self.owner, current) {
            (Some(owner), Some(current)) if owner == current => Some(self.tab),
            _ => None,
        }
    }
}

/// Resolve the tab to render.
///
/// ```text
/// desired   = ownership.tab   if ownership.owner == current  else default
/// effective = desired         if visible contains it         else terminal
/// ```
pub fn effective_tab(
    ownership: Option<&TabOwnership>,
    current: Option<&ExecutionId>,
    default_tab: TabId,
    visible: &VisibleTabSet,
) -> TabId {
    let desired = ownership
        .and_then(|ownership| ownership.tab_for(current))
        .unwrap_or(default_tab);
    if visible.contains(desired) {
        desired
    } else {
        TabId::Terminal
    }
}
