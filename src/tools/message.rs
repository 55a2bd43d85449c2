use serde::Deserialize;

use super::{parse_args, Tool, ToolContext};
use crate::OutboundMessage;

#[derive(Debug, Deserialize)]
struct MessageArgs {
    #[serde(default)]
    content: String,
    #[serde(default)]
    media: Vec<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    chat_id: Option<String>,
}

/// `message`: push a message to a chat mid-turn. Target defaults to the calling chat.
pub(crate) struct MessageTool;

impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "Send a message to the user. Use this when you want to communicate something."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {"type": "string", "description": "The message content to send"},
                "media": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Optional: file paths to attach (e.g., screenshots, images)"
                },
                "channel": {"type": "string", "description": "Optional: target channel (telegram, discord, etc.)"},
                "chat_id": {"type": "string", "description": "Optional: target chat/user ID"}
            },
            "required": ["content"]
        })
    }

    fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<String, String> {
        let parsed: MessageArgs = parse_args(args)?;
        if parsed.content.trim().is_empty() && parsed.media.is_empty() {
            return Err("Error: Cannot send empty message without media".into());
        }
        let channel = parsed
            .channel
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| ctx.channel.clone());
        let chat_id = parsed
            .chat_id
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| ctx.chat_id.clone());
        if channel.is_empty() || chat_id.is_empty() {
            return Err("Error: No target channel/chat specified".into());
        }
        let Some(bus) = &ctx.bus else {
            return Err("Error: Message sending not configured".into());
        };
        let mut msg = OutboundMessage::new(&channel, &chat_id, &parsed.content);
        msg.media = parsed.media;
        if !bus.publish_outbound(msg) {
            return Err(format!("Error sending message: outbound queue for {channel} is closed"));
        }
        tracing::debug!(target: "tools", channel = %channel, chat_id = %chat_id, "message tool published");
        Ok(format!("Message sent to {channel}:{chat_id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageBus;

    #[test]
    fn test_defaults_to_context_chat() {
        let bus = MessageBus::new();
        let ctx = ToolContext::new("telegram", "42").with_bus(Some(bus.clone()));
        let out = MessageTool.execute(&serde_json::json!({"content": "working on it"}), &ctx).unwrap();
        assert_eq!(out, "Message sent to telegram:42");
        let sent = bus.drain_outbound();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, "42");
        assert_eq!(sent[0].content, "working on it");

        let out = MessageTool
            .execute(
                &serde_json::json!({"content": "", "media": ["shot.png"], "channel": "slack", "chat_id": "C1"}),
                &ctx,
            )
            .unwrap();
        assert_eq!(out, "Message sent to slack:C1");
        assert_eq!(bus.drain_outbound()[0].media, vec!["shot.png".to_string()]);
    }

    #[test]
    fn test_errors() {
        let ctx = ToolContext::new("cli", "direct");
        assert_eq!(
            MessageTool.execute(&serde_json::json!({"content": "  "}), &ctx).unwrap_err(),
            "Error: Cannot send empty message without media"
        );
        assert_eq!(
            MessageTool.execute(&serde_json::json!({"content": "hi"}), &ctx).unwrap_err(),
            "Error: Message sending not configured"
        );
        assert_eq!(
            MessageTool
                .execute(&serde_json::json!({"content": "hi"}), &ToolContext::default())
                .unwrap_err(),
            "Error: No target channel/chat specified"
        );
    }
}
