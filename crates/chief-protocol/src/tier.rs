//! # Message Tiers
//!
//! Every outgoing message type maps to a priority tier. The tier decides
//! how long the batcher may hold the message before flushing, and which
//! messages are dropped first when the buffer is full.
//!
//! ## Tier Table
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Message Type → Tier                              │
//! │                                                                         │
//! │  IMMEDIATE (flush now, dropped last)                                   │
//! │  ─────────────────────────────────────                                 │
//! │  run_complete, run_paused, error, clone_complete, session_expired,     │
//! │  quota_exhausted, prd_response_complete                                │
//! │                                                                         │
//! │  STANDARD (flush after 200ms of quiet)                                 │
//! │  ─────────────────────────────────────                                 │
//! │  claude_output, prd_output, run_progress, clone_progress               │
//! │  + every type not listed here                                          │
//! │                                                                         │
//! │  LOW PRIORITY (flush after 1s of quiet, dropped first)                 │
//! │  ─────────────────────────────────────                                 │
//! │  state_snapshot, project_state, project_list, settings, log_lines      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

/// Known outgoing message types.
pub mod message_type {
    pub const RUN_COMPLETE: &str = "run_complete";
    pub const RUN_PAUSED: &str = "run_paused";
    pub const ERROR: &str = "error";
    pub const CLONE_COMPLETE: &str = "clone_complete";
    pub const SESSION_EXPIRED: &str = "session_expired";
    pub const QUOTA_EXHAUSTED: &str = "quota_exhausted";
    pub const PRD_RESPONSE_COMPLETE: &str = "prd_response_complete";

    pub const CLAUDE_OUTPUT: &str = "claude_output";
    pub const PRD_OUTPUT: &str = "prd_output";
    pub const RUN_PROGRESS: &str = "run_progress";
    pub const CLONE_PROGRESS: &str = "clone_progress";

    pub const STATE_SNAPSHOT: &str = "state_snapshot";
    pub const PROJECT_STATE: &str = "project_state";
    pub const PROJECT_LIST: &str = "project_list";
    pub const SETTINGS: &str = "settings";
    pub const LOG_LINES: &str = "log_lines";
}

const IMMEDIATE_TYPES: &[&str] = &[
    message_type::RUN_COMPLETE,
    message_type::RUN_PAUSED,
    message_type::ERROR,
    message_type::CLONE_COMPLETE,
    message_type::SESSION_EXPIRED,
    message_type::QUOTA_EXHAUSTED,
    message_type::PRD_RESPONSE_COMPLETE,
];

const LOW_PRIORITY_TYPES: &[&str] = &[
    message_type::STATE_SNAPSHOT,
    message_type::PROJECT_STATE,
    message_type::PROJECT_LIST,
    message_type::SETTINGS,
    message_type::LOG_LINES,
];

/// Flush and drop priority of an outgoing message.
///
/// Displays as `low-priority`; serializes as `low_priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Flushed as soon as it is buffered.
    Immediate,
    /// Flushed after a short debounce window.
    Standard,
    /// Flushed after a long debounce window; evicted first under pressure.
    LowPriority,
}

impl Tier {
    /// Tiers from the first to be evicted to the last.
    pub const EVICTION_ORDER: [Tier; 3] = [Tier::LowPriority, Tier::Standard, Tier::Immediate];

    /// Returns the tier for a message type. Unknown types are `Standard`.
    pub fn of(message_type: &str) -> Tier {
        if IMMEDIATE_TYPES.contains(&message_type) {
            Tier::Immediate
        } else if LOW_PRIORITY_TYPES.contains(&message_type) {
            Tier::LowPriority
        } else {
            Tier::Standard
        }
    }

    /// Numeric priority; higher survives eviction longer.
    pub fn priority(self) -> u8 {
        match self {
            Tier::Immediate => 2,
            Tier::Standard => 1,
            Tier::LowPriority => 0,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Immediate => write!(f, "immediate"),
            Tier::Standard => write!(f, "standard"),
            Tier::LowPriority => write!(f, "low-priority"),
        }
    }
}
