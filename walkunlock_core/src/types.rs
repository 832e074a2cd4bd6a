//! Core domain types for the WalkUnlock system.
//!
//! This module defines the fundamental types shared by the ledger, the
//! registry and the enforcer:
//! - Locked app records and their persisted form
//! - Step balance snapshots
//! - Usage summaries kept after a session ends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Locked Apps
// ============================================================================

/// An app gated behind a step cost
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockedApp {
    /// Unique key (package or bundle id)
    pub app_id: String,
    pub display_name: String,
    /// Steps charged per full minute in the foreground. Zero means free.
    pub cost_per_minute: u64,
    /// Encoded image blob, stored as base64. Undecodable icons load as `None`.
    #[serde(default, with = "icon_base64")]
    pub icon: Option<Vec<u8>>,
}

impl LockedApp {
    pub fn new(
        app_id: impl Into<String>,
        display_name: impl Into<String>,
        cost_per_minute: u64,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            display_name: display_name.into(),
            cost_per_minute,
            icon: None,
        }
    }

    pub fn with_icon(mut self, icon: Vec<u8>) -> Self {
        self.icon = Some(icon);
        self
    }

    /// Whether the app can be opened at all with `available` steps
    pub fn affordable_with(&self, available: u64) -> bool {
        available >= self.cost_per_minute
    }
}

mod icon_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(icon: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match icon {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        // Any shape other than a decodable string drops the icon, not the entry.
        let raw = Option::<serde_json::Value>::deserialize(d)?;
        let decoded = raw.as_ref().and_then(|v| v.as_str()).and_then(|s| {
            let compact: String = s.split_whitespace().collect();
            match STANDARD.decode(compact) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    tracing::warn!("Dropping undecodable app icon: {}", e);
                    None
                }
            }
        });
        Ok(decoded)
    }
}

// ============================================================================
// Step Balance
// ============================================================================

/// Point-in-time view of the step ledger
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepBalance {
    pub total: u64,
    pub redeemed: u64,
    pub available: u64,
}

impl StepBalance {
    pub fn from_counters(total: u64, redeemed: u64) -> Self {
        Self {
            total,
            redeemed,
            available: total.saturating_sub(redeemed),
        }
    }
}

// ============================================================================
// Usage History
// ============================================================================

/// Why a usage session stopped
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    /// Another app (or none) took the foreground
    LeftForeground,
    /// The app was removed from the registry
    Unlocked,
    /// The app's cost was changed while it was being tracked
    PolicyChanged,
    /// The balance ran out
    Blocked,
    /// The enforcer was shut down
    Shutdown,
}

/// Final figures of a finished session, kept per app for display only
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageSummary {
    pub app_id: String,
    pub minutes_used: u64,
    pub steps_charged: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub end: SessionEnd,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_never_negative() {
        let balance = StepBalance::from_counters(10, 25);
        assert_eq!(balance.available, 0);

        let balance = StepBalance::from_counters(100, 30);
        assert_eq!(balance.available, 70);
    }

    #[test]
    fn test_icon_roundtrip_through_json() {
        let app = LockedApp::new("com.example.game", "Game", 30).with_icon(vec![0x89, 0x50, 0x4e]);
        let json = serde_json::to_string(&app).unwrap();
        assert!(json.contains("iVBO"));

        let parsed: LockedApp = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, app);
    }

    #[test]
    fn test_bad_icon_keeps_entry() {
        let json = r#"{
            "app_id": "com.example.social",
            "display_name": "Social",
            "cost_per_minute": 5,
            "icon": "***not base64***"
        }"#;
        let parsed: LockedApp = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.app_id, "com.example.social");
        assert!(parsed.icon.is_none());

        let json = r#"{"app_id": "a", "display_name": "A", "cost_per_minute": 1, "icon": 42}"#;
        let parsed: LockedApp = serde_json::from_str(json).unwrap();
        assert!(parsed.icon.is_none());
    }

    #[test]
    fn test_missing_icon_field() {
        let json = r#"{"app_id": "a", "display_name": "A", "cost_per_minute": 0}"#;
        let parsed: LockedApp = serde_json::from_str(json).unwrap();
        assert!(parsed.icon.is_none());
        assert!(parsed.affordable_with(0));
    }

    #[test]
    fn test_icon_with_line_breaks_decodes() {
        let json = "{\"app_id\": \"a\", \"display_name\": \"A\", \"cost_per_minute\": 1, \"icon\": \"AAEC\\nAw==\\n\"}";
        let parsed: LockedApp = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.icon, Some(vec![0, 1, 2, 3]));
    }
}
