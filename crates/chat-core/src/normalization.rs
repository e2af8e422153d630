use crate::{
    error::ChatError,
    types::{ChatEvent, ChatMessage, SendAck},
};

/// Send result before it is turned into an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The server persisted the message.
    Success { message: ChatMessage },
    /// The send failed; `restored_text` goes back to the input field.
    Failure {
        error: ChatError,
        restored_text: Option<String>,
    },
}

/// Convert a send outcome into a stable `ChatEvent::SendAck`.
pub fn normalize_send_outcome(client_txn_id: impl Into<String>, outcome: SendOutcome) -> ChatEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        SendOutcome::Success { message } => ChatEvent::SendAck(SendAck {
            client_txn_id,
            message_id: Some(message.id),
            error_code: None,
            restored_text: None,
        }),
        SendOutcome::Failure {
            error,
            restored_text,
        } => ChatEvent::SendAck(SendAck {
            client_txn_id,
            message_id: None,
            error_code: Some(error.code),
            restored_text,
        }),
    }
}

pub fn normalize_failure(error: ChatError) -> ChatEvent {
    let recoverable = error.is_recoverable();
    ChatEvent::Failure {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::error::ChatErrorCategory;

    fn persisted() -> ChatMessage {
        ChatMessage {
            id: 42,
            sender_id: 1,
            sender_name: None,
            receiver_id: 2,
            receiver_name: None,
            text: "Hello".into(),
            sent_at: NaiveDate::from_ymd_opt(2024, 5, 1)
                .and_then(|date| date.and_hms_opt(8, 0, 0))
                .expect("timestamp"),
            is_read: false,
        }
    }

    #[test]
    fn maps_success_to_ack_with_message_id() {
        let event = normalize_send_outcome(
            "txn-1",
            SendOutcome::Success {
                message: persisted(),
            },
        );

        match event {
            ChatEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-1");
                assert_eq!(ack.message_id, Some(42));
                assert_eq!(ack.error_code, None);
                assert_eq!(ack.restored_text, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_failure_to_ack_with_code_and_restored_text() {
        let event = normalize_send_outcome(
            "txn-2",
            SendOutcome::Failure {
                error: ChatError::delivery("http_503", "unavailable"),
                restored_text: Some("Hello".into()),
            },
        );

        match event {
            ChatEvent::SendAck(ack) => {
                assert_eq!(ack.message_id, None);
                assert_eq!(ack.error_code.as_deref(), Some("http_503"));
                assert_eq!(ack.restored_text.as_deref(), Some("Hello"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn failure_event_carries_recoverability() {
        let event = normalize_failure(ChatError::new(
            ChatErrorCategory::NotFound,
            "user_not_found",
            "no user 9",
        ));
        assert_eq!(
            event,
            ChatEvent::Failure {
                code: "user_not_found".into(),
                message: "no user 9".into(),
                recoverable: false,
            }
        );
    }
}
