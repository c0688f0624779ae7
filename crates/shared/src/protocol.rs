use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    ContestantStatus, ControlCommand, MatchId, QuestionId, RegistrationNumber, RenderMode,
    RescueId, RescueStatus,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchInfo {
    pub id: MatchId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_question_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_remaining: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentQuestion {
    pub id: QuestionId,
    pub order: u32,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_type: Option<String>,
    /// Seconds allotted to the question.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescueEntry {
    pub id: RescueId,
    pub name: String,
    pub status: RescueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_order: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenControlState {
    pub control_key: RenderMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_value: Option<ControlCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionSummary {
    pub id: QuestionId,
    pub order: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenUpdate {
    pub control_key: RenderMode,
    #[serde(default)]
    pub control_value: Option<ControlCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentQuestionPush {
    pub match_info: MatchInfo,
    pub current_question: CurrentQuestion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerUpdate {
    pub time_remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescueUpdate {
    pub registration_number: RegistrationNumber,
    pub status: ContestantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rescue_id: Option<RescueId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescueStatusUpdate {
    pub updated_rescues: Vec<RescueUpdate>,
}

/// Envelope of every frame the controller pushes over the websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum PushEvent {
    #[serde(rename = "screen:update")]
    ScreenUpdate(ScreenUpdate),
    #[serde(rename = "currentQuestion:get")]
    CurrentQuestion(CurrentQuestionPush),
    #[serde(rename = "timer:update")]
    TimerUpdate(TimerUpdate),
    #[serde(rename = "rescue:statusUpdated")]
    RescueStatusUpdated(RescueStatusUpdate),
}

impl PushEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScreenUpdate(_) => "screen:update",
            Self::CurrentQuestion(_) => "currentQuestion:get",
            Self::TimerUpdate(_) => "timer:update",
            Self::RescueStatusUpdated(_) => "rescue:statusUpdated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_screen_update_envelope() {
        let raw = r#"{"event":"screen:update","data":{"controlKey":"rosterEliminated","controlValue":"Eliminate"}}"#;
        let event: PushEvent = serde_json::from_str(raw).expect("decode");
        assert_eq!(
            event,
            PushEvent::ScreenUpdate(ScreenUpdate {
                control_key: RenderMode::RosterEliminated,
                control_value: Some(ControlCommand::Eliminate),
                media: None,
                sequence: None,
                sent_at: None,
            })
        );
    }

    #[test]
    fn keeps_unknown_control_values_verbatim() {
        let raw = r#"{"event":"screen:update","data":{"controlKey":"answer","controlValue":"reveal"}}"#;
        let event: PushEvent = serde_json::from_str(raw).expect("decode");
        let PushEvent::ScreenUpdate(update) = event else {
            panic!("unexpected event");
        };
        assert_eq!(
            update.control_value,
            Some(ControlCommand::Custom("reveal".into()))
        );
    }

    #[test]
    fn rejects_unknown_event_names() {
        let raw = r#"{"event":"chat:message","data":{}}"#;
        assert!(serde_json::from_str::<PushEvent>(raw).is_err());
    }

    #[test]
    fn decodes_rescue_status_update() {
        let raw = r#"{"event":"rescue:statusUpdated","data":{"updatedRescues":[{"registrationNumber":7,"status":"rescued","questionOrder":4}]}}"#;
        let event: PushEvent = serde_json::from_str(raw).expect("decode");
        let PushEvent::RescueStatusUpdated(update) = event else {
            panic!("unexpected event");
        };
        assert_eq!(update.updated_rescues.len(), 1);
        assert_eq!(
            update.updated_rescues[0].registration_number,
            RegistrationNumber(7)
        );
        assert_eq!(update.updated_rescues[0].status, ContestantStatus::Rescued);
    }
}
