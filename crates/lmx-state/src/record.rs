//! The persisted runtime state record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record persisted across process restarts
///
/// Mid-session writes always carry `last_clean_shutdown = false`; only the
/// final write of a graceful shutdown flips it to true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub loaded_models: Vec<String>,

    #[serde(default = "default_clean")]
    pub last_clean_shutdown: bool,

    /// Process that last wrote the record
    #[serde(default)]
    pub pid: u32,

    #[serde(default = "Utc::now")]
    pub saved_at: DateTime<Utc>,

    /// Lifetime startup counter, never reset
    #[serde(default)]
    pub startup_count: u64,

    #[serde(default)]
    pub last_startup_at: Option<DateTime<Utc>>,

    /// Startups since the last clean shutdown that still fall inside the crash-loop window
    #[serde(default)]
    pub recent_startups: Vec<DateTime<Utc>>,
}

fn default_clean() -> bool {
    true
}

impl RuntimeState {
    /// Record for a first run: nothing loaded, treated as a clean exit
    pub fn first_run(pid: u32) -> Self {
        Self {
            loaded_models: Vec::new(),
            last_clean_shutdown: true,
            pid,
            saved_at: Utc::now(),
            startup_count: 0,
            last_startup_at: None,
            recent_startups: Vec::new(),
        }
    }

    /// True when the previous process died without a graceful shutdown
    pub fn was_unclean(&self) -> bool {
        !self.last_clean_shutdown
    }
}
