//! `BrowsingAction`, `BrowsingTrajectory`, `BrowsingSkill` (§3, §4.10).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    Navigate,
    Click,
    Fill,
    Select,
    Scroll,
    Wait,
    Extract,
    DismissBanner,
}

impl ActionType {
    /// `click`, `fill`, `select` are critical: failure aborts skill
    /// execution before subsequent critical actions run (§4.10).
    pub fn is_critical(self) -> bool {
        matches!(self, ActionType::Click | ActionType::Fill | ActionType::Select)
    }
}

/// Immutable once recorded (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowsingAction {
    pub action_type: ActionType,
    pub selector: Option<String>,
    pub url: Option<String>,
    pub value: Option<String>,
    pub wait_for: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrajectoryContentSummary {
    pub text_len: usize,
    pub tables: usize,
    pub apis: usize,
}

/// Owned by the session; moved to Procedural Memory on completion (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowsingTrajectory {
    pub id: Uuid,
    pub domain: String,
    pub start_url: String,
    pub end_url: String,
    pub actions: Vec<BrowsingAction>,
    pub success: bool,
    pub total_duration_ms: u64,
    pub extracted_content: TrajectoryContentSummary,
}

impl BrowsingTrajectory {
    pub fn new(domain: impl Into<String>, start_url: impl Into<String>) -> Self {
        let start_url = start_url.into();
        Self {
            id: Uuid::now_v7(),
            domain: domain.into(),
            end_url: start_url.clone(),
            start_url,
            actions: Vec::new(),
            success: false,
            total_duration_ms: 0,
            extracted_content: TrajectoryContentSummary::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillPreconditions {
    pub required_selectors: Vec<String>,
    pub page_features: Vec<String>,
}

/// Distilled from >= K (default 3) similar successful trajectories
/// (§3, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowsingSkill {
    pub id: Uuid,
    pub name: String,
    pub domain: String,
    pub page_type: String,
    pub preconditions: SkillPreconditions,
    pub action_sequence: Vec<BrowsingAction>,
    pub embedding: Option<Vec<f32>>,
    pub uses: u64,
    pub success_rate: f32,
}

impl BrowsingSkill {
    /// Exponential-moving success-rate update with alpha=0.2 (§4.10
    /// `record_skill_execution`).
    pub fn record_execution(&mut self, success: bool) {
        const ALPHA: f32 = 0.2;
        self.uses += 1;
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = self.success_rate + ALPHA * (outcome - self.success_rate);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_type: ActionType,
    pub selector: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillExecutionTrace {
    pub skill_id: Option<Uuid>,
    pub actions_executed: usize,
    pub used_fallback: bool,
    pub results: Vec<ActionResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_actions_are_click_fill_select() {
        assert!(ActionType::Click.is_critical());
        assert!(ActionType::Fill.is_critical());
        assert!(ActionType::Select.is_critical());
        assert!(!ActionType::Scroll.is_critical());
        assert!(!ActionType::Wait.is_critical());
    }

    #[test]
    fn skill_success_rate_moves_toward_outcome() {
        let mut skill = BrowsingSkill {
            id: Uuid::now_v7(),
            name: "test".into(),
            domain: "example.com".into(),
            page_type: "detail".into(),
            preconditions: SkillPreconditions::default(),
            action_sequence: Vec::new(),
            embedding: None,
            uses: 0,
            success_rate: 0.5,
        };
        skill.record_execution(true);
        assert!(skill.success_rate > 0.5);
        skill.record_execution(false);
        assert!(skill.success_rate < 0.6);
    }
}
