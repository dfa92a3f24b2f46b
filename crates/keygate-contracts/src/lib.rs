use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const API_VERSION: &str = "1.0.0";

pub const LIST_METHODS_COMMAND: &str = "/methods";
pub const INVOKE_SIGIL: char = '/';
pub const KEYGEN_COMMAND: &str = ".keygen";
pub const REDEEM_COMMAND: &str = ".redeem";

/// A chat message as forwarded by the gateway bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundMessage {
    #[serde(default)]
    pub message_id: String,
    pub guild_id: String,
    pub channel_id: String,
    pub author: Author,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Author {
    pub id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    SelfMessage,
    RoleLookupFailed,
    ListMethods,
    Invoke,
    KeyGen,
    Redeem,
    Ignored,
}

/// What the dispatcher decided for one inbound message.
///
/// `replies` are delivered to the originating channel in order. `audit`, when
/// present, is the text posted to the audit webhook after delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub message_id: String,
    pub command: CommandKind,
    pub replies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<String>,
    pub handled_at: String,
}

impl DispatchOutcome {
    pub fn silent(message_id: &str, command: CommandKind, handled_at: String) -> Self {
        Self {
            message_id: message_id.to_string(),
            command,
            replies: Vec::new(),
            audit: None,
            handled_at,
        }
    }
}

pub fn command_surface() -> Value {
    json!({
        "version": API_VERSION,
        "commands": [
            {"syntax": LIST_METHODS_COMMAND, "role": null, "audited": true},
            {
                "syntax": "/{method} {target} {port} {time}",
                "role": "allowedRoleId",
                "audited": true
            },
            {"syntax": KEYGEN_COMMAND, "role": "keyRoleId", "audited": false},
            {"syntax": format!("{REDEEM_COMMAND} {{key}}"), "role": null, "audited": false}
        ]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_message_tolerates_missing_optional_fields() {
        let msg: InboundMessage = serde_json::from_str(
            r#"{"guild_id":"g","channel_id":"c","author":{"id":"u"},"content":".keygen"}"#,
        )
        .unwrap();
        assert_eq!(msg.message_id, "");
        assert_eq!(msg.author.username, "");
    }

    #[test]
    fn surface_lists_redeem_syntax() {
        let surface = command_surface();
        assert_eq!(surface["commands"][3]["syntax"], ".redeem {key}");
    }
}
