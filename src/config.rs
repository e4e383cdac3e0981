use crate::Observer;

/// Recognized construction options (§6): the election name is required,
/// everything else defaults.
#[derive(Default)]
pub struct ElectionConfig {
    /// Election name; prefix `/elections/` is prepended. Must be non-empty.
    pub election: String,
    /// Candidate display name. Defaults to the OS hostname.
    pub candidate: Option<String>,
    /// Lease TTL in seconds; also the controller timeout and backoff cap.
    /// Defaults to 5.
    pub ttl_secs: Option<i64>,
    /// Registered under observer id `"conf"` if present.
    pub observer: Option<Observer>,
}

impl ElectionConfig {
    pub fn new(election: impl Into<String>) -> Self {
        Self {
            election: election.into(),
            ..Default::default()
        }
    }

    pub fn with_candidate(mut self, candidate: impl Into<String>) -> Self {
        self.candidate = Some(candidate.into());
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// The OS hostname, falling back to `"unknown"` if it can't be read or
/// isn't valid UTF-8 — matches the ecosystem convention of defaulting a
/// candidate/instance identity to the host's name.
pub fn default_candidate_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
