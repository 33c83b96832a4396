use serde::{Deserialize, Serialize};

/// Glob pattern (wrapper type for clarity), matched against root-relative
/// paths such as `docs/readme.txt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(pub String);

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        Pattern(s.to_string())
    }
}

/// Tuning for one [`ReplicatorSource`](crate::ReplicatorSource).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOptions {
    #[serde(default)]
    pub include: Vec<Pattern>,
    #[serde(default)]
    pub exclude: Vec<Pattern>,
    /// Extra send attempts for a live operation before it is given up
    #[serde(default = "SourceOptions::default_retry_max")]
    pub retry_max: u32,
    /// Initial backoff in ms between attempts (doubles each time)
    #[serde(default = "SourceOptions::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl SourceOptions {
    fn default_retry_max() -> u32 { 3 }
    fn default_retry_backoff_ms() -> u64 { 100 }
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            retry_max: Self::default_retry_max(),
            retry_backoff_ms: Self::default_retry_backoff_ms(),
        }
    }
}
