use super::*;

use chrono::TimeZone;
use serde_json::json;

use crate::error::ErrorCode;

fn sample_message() -> MessagePayload {
    MessagePayload {
        message_id: MessageId(41),
        conversation_id: ConversationId(7),
        sender: SenderRole::Assistant,
        content: "Done".into(),
        created_at: Utc
            .with_ymd_and_hms(2026, 1, 1, 9, 0, 0)
            .single()
            .expect("valid time"),
        attachments: Vec::new(),
    }
}

#[test]
fn send_request_uses_the_realtime_envelope() {
    let request = RealtimeRequest::SendMessage(SendMessageRequest {
        conversation_id: Some(ConversationId(7)),
        text: "hi".into(),
        attachments: vec![AttachmentRef {
            file_id: FileId(3),
            filename: "invoice.pdf".into(),
            mime_type: None,
        }],
    });

    assert_eq!(
        serde_json::to_value(&request).expect("encode"),
        json!({
            "type": "send_message",
            "payload": {
                "conversation_id": 7,
                "text": "hi",
                "attachments": [{"file_id": 3, "filename": "invoice.pdf"}]
            }
        })
    );
}

#[test]
fn new_conversation_request_omits_the_id() {
    let request = SendMessageRequest {
        conversation_id: None,
        text: "hi".into(),
        attachments: Vec::new(),
    };
    assert_eq!(
        serde_json::to_value(&request).expect("encode"),
        json!({"text": "hi"})
    );
}

#[test]
fn decodes_message_created_event() {
    let raw = json!({
        "type": "message_created",
        "payload": {
            "message": {
                "message_id": 41,
                "conversation_id": 7,
                "sender": "assistant",
                "content": "Done",
                "created_at": "2026-01-01T09:00:00Z"
            }
        }
    });

    let event: RealtimeEvent = serde_json::from_value(raw).expect("decode");

    assert_eq!(
        event,
        RealtimeEvent::MessageCreated {
            message: sample_message()
        }
    );
}

#[test]
fn legacy_user_sender_reads_as_operator() {
    let mut raw = serde_json::to_value(sample_message()).expect("encode");
    raw["sender"] = json!("user");
    let message: MessagePayload = serde_json::from_value(raw).expect("decode");
    assert_eq!(message.sender, SenderRole::Operator);
}

#[test]
fn decodes_error_event() {
    let raw = json!({
        "type": "error",
        "payload": {"code": "assistant_unavailable", "message": "model overloaded"}
    });

    let event: RealtimeEvent = serde_json::from_value(raw).expect("decode");

    let RealtimeEvent::Error(error) = event else {
        panic!("expected error event");
    };
    assert_eq!(error.code, ErrorCode::AssistantUnavailable);
}

#[test]
fn ordering_values_match_the_query_parameter() {
    assert_eq!(
        serde_json::to_value(ConversationOrdering::LastMessageDesc).expect("encode"),
        json!("-last_message_at")
    );
    assert_eq!(
        serde_json::to_value(ConversationOrdering::LastMessageAsc).expect("encode"),
        json!("last_message_at")
    );
}

#[test]
fn clearing_the_client_sends_null() {
    let request = UpdateConversationRequest { client_id: None };
    assert_eq!(
        serde_json::to_value(&request).expect("encode"),
        json!({"client_id": null})
    );
}

#[test]
fn roster_entry_tolerates_missing_optional_fields() {
    let summary: ConversationSummary =
        serde_json::from_value(json!({"conversation_id": 2, "title": "Support"}))
            .expect("decode");
    assert_eq!(summary.last_message_at, None);
    assert!(summary.participant_ids.is_empty());
}
