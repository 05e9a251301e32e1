//! Control messages exchanged over the `oai-events` data channel.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// `session.update`, отправляемый при открытии data channel.
///
/// Поля из `session` минта имеют приоритет над настройками.
pub fn session_update(
    instructions: Option<&str>,
    modalities: &[String],
    voice: Option<&str>,
    minted: Option<Value>,
) -> Value {
    let mut session = Map::new();
    if let Some(instructions) = instructions.filter(|i| !i.trim().is_empty()) {
        session.insert("instructions".into(), Value::from(instructions));
    }
    if !modalities.is_empty() {
        session.insert("modalities".into(), json!(modalities));
    }
    if let Some(voice) = voice {
        session.insert("voice".into(), Value::from(voice));
    }
    if let Some(Value::Object(extra)) = minted {
        session.extend(extra);
    }

    json!({
        "type": "session.update",
        "session": Value::Object(session),
    })
}

/// Изображение как сообщение пользователя и запрос ответа на него
pub fn image_messages(data_url: &str) -> [Value; 2] {
    [
        json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "user",
                "content": [{ "type": "input_image", "image_url": data_url }],
            },
        }),
        json!({ "type": "response.create" }),
    ]
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// Событие сервера из data channel
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub error: Option<ServerError>,
}

impl ServerEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_error(&self) -> bool {
        self.kind == "error" || self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_update_merges_minted_fields() {
        let update = session_update(
            Some("answer in French"),
            &["audio".to_string(), "text".to_string()],
            Some("alloy"),
            Some(json!({ "voice": "verse", "turn_detection": { "type": "server_vad" } })),
        );
        assert_eq!(update["type"], "session.update");
        assert_eq!(update["session"]["instructions"], "answer in French");
        assert_eq!(update["session"]["modalities"], json!(["audio", "text"]));
        assert_eq!(update["session"]["voice"], "verse");
        assert_eq!(update["session"]["turn_detection"]["type"], "server_vad");
    }

    #[test]
    fn test_image_messages_shape() {
        let [item, response] = image_messages("data:image/png;base64,AAAA");
        assert_eq!(item["type"], "conversation.item.create");
        assert_eq!(
            item["item"]["content"][0]["image_url"],
            "data:image/png;base64,AAAA"
        );
        assert_eq!(response["type"], "response.create");
    }

    #[test]
    fn test_parse_server_error_event() {
        let event = ServerEvent::parse(
            r#"{"type":"error","event_id":"e1","error":{"message":"bad","code":"invalid_value"}}"#,
        )
        .unwrap();
        assert!(event.is_error());
        assert_eq!(event.error.unwrap().code.as_deref(), Some("invalid_value"));

        assert!(ServerEvent::parse("not json").is_err());
        assert!(!ServerEvent::parse(r#"{"type":"session.created"}"#)
            .unwrap()
            .is_error());
    }
}
