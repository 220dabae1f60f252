//! Execution identity and the parts of the execution record the drawer reads.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque identifier of one test-execution run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Percent-encoded form, safe as one URL path segment or file name.
    /// Distinct ids always encode to distinct strings.
    pub fn percent_encoded(&self) -> String {
        let mut out = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(byte as char)
                }
                other => out.push_str(&format!("%{other:02X}")),
            }
        }
        out
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ExecutionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Execution status as reported by the API.
///
/// Membership is owned by the server. Values this client does not know are
/// kept verbatim in `Other` and treated as non-live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Running,
    Analyzing,
    Passed,
    Failed,
    Error,
    Unstable,
    Other(String),
}

impl ExecutionStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => Self::Running,
            "ANALYZING" => Self::Analyzing,
            "PASSED" => Self::Passed,
            "FAILED" => Self::Failed,
            "ERROR" => Self::Error,
            "UNSTABLE" => Self::Unstable,
            _ => Self::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "RUNNING",
            Self::Analyzing => "ANALYZING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Unstable => "UNSTABLE",
            Self::Other(raw) => raw,
        }
    }

    /// Whether the execution is still producing output (the push channel and
    /// artifact polling only matter while this holds).
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Analyzing)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ExecutionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ExecutionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// The slice of the server-side execution record the drawer depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub status: ExecutionStatus,
    /// Whether an AI analysis exists for this run.
    #[serde(default, rename = "analysis", deserialize_with = "deserialize_presence")]
    pub has_analysis: bool,
}

impl ExecutionRecord {
    pub fn new(id: impl Into<ExecutionId>, status: ExecutionStatus) -> Self {
        Self {
            id: id.into(),
            status,
            has_analysis: false,
        }
    }

    pub fn with_analysis(mut self, has_analysis: bool) -> Self {
        self.has_analysis = has_analysis;
        self
    }
}

/// The API reports analysis as an object (or null); a bare boolean is also
/// accepted.
fn deserialize_presence<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Bool(present)) => present,
        Some(_) => true,
    })
}

/// One artifact produced by an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}
