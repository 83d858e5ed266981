//! Status condition type shared by the three CRDs.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status values, mirroring the Kubernetes convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

/// A status condition on a CR.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(
        r#type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: status.as_str().to_string(),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}

/// Upsert a condition by type. The transition time is kept when the status
/// value did not change.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        let transition_time = if existing.status == condition.status {
            existing.last_transition_time.clone()
        } else {
            condition.last_transition_time.clone()
        };
        *existing = Condition {
            last_transition_time: transition_time,
            ..condition
        };
    } else {
        conditions.push(condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_condition_inserts_and_replaces() {
        let mut conditions = Vec::new();
        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::False, "Failed", "boom"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "False");

        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "Succeeded", "ok"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
        assert_eq!(conditions[0].reason.as_deref(), Some("Succeeded"));
    }

    #[test]
    fn test_set_condition_keeps_transition_time_on_same_status() {
        let mut conditions = vec![Condition {
            r#type: "Ready".to_string(),
            status: "True".to_string(),
            last_transition_time: Some("2026-01-01T00:00:00Z".to_string()),
            reason: None,
            message: None,
        }];
        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "Succeeded", "still fine"),
        );
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2026-01-01T00:00:00Z")
        );
        assert_eq!(conditions[0].message.as_deref(), Some("still fine"));
    }
}
