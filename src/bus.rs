//! In-process message bus between channels and the agent thread.

use std::collections::BTreeMap;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct InboundMessage {
    pub(crate) channel: String,
    pub(crate) sender_id: String,
    pub(crate) chat_id: String,
    pub(crate) content: String,
    #[serde(default)]
    pub(crate) media: Vec<String>,
    #[serde(default)]
    pub(crate) metadata: BTreeMap<String, serde_json::Value>,
}

impl InboundMessage {
    pub(crate) fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub(crate) fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct OutboundMessage {
    pub(crate) channel: String,
    pub(crate) chat_id: String,
    pub(crate) content: String,
    #[serde(default)]
    pub(crate) media: Vec<String>,
    #[serde(default)]
    pub(crate) metadata: BTreeMap<String, serde_json::Value>,
}

impl OutboundMessage {
    pub(crate) fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            media: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Cloneable handle; every clone feeds the same two queues.
#[derive(Clone)]
pub(crate) struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Arc<Mutex<mpsc::Receiver<OutboundMessage>>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub(crate) fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel();
        let (outbound_tx, outbound_rx) = mpsc::channel();
        Self {
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
        }
    }

    pub(crate) fn publish_inbound(&self, msg: InboundMessage) -> bool {
        self.inbound_tx.send(msg).is_ok()
    }

    /// Blocks up to `timeout`; `None` means nothing arrived.
    pub(crate) fn consume_inbound(&self, timeout: Duration) -> Option<InboundMessage> {
        let rx = self.inbound_rx.lock().unwrap_or_else(|e| e.into_inner());
        rx.recv_timeout(timeout).ok()
    }

    pub(crate) fn publish_outbound(&self, msg: OutboundMessage) -> bool {
        tracing::debug!(target: "bus", channel = %msg.channel, chat_id = %msg.chat_id, "outbound");
        self.outbound_tx.send(msg).is_ok()
    }

    pub(crate) fn consume_outbound(&self, timeout: Duration) -> Option<OutboundMessage> {
        let rx = self.outbound_rx.lock().unwrap_or_else(|e| e.into_inner());
        rx.recv_timeout(timeout).ok()
    }

    /// Drain whatever outbound messages are already queued.
    pub(crate) fn drain_outbound(&self) -> Vec<OutboundMessage> {
        let rx = self.outbound_rx.lock().unwrap_or_else(|e| e.into_inner());
        rx.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_inbound_roundtrip_across_threads() {
        let bus = MessageBus::new();
        let producer = bus.clone();
        thread::spawn(move || {
            producer.publish_inbound(InboundMessage::new("cli", "user", "direct", "hello"));
        })
        .join()
        .unwrap();
        let msg = bus.consume_inbound(Duration::from_secs(1)).unwrap();
        assert_eq!(msg.session_key(), "cli:direct");
        assert_eq!(msg.content, "hello");
        assert!(bus.consume_inbound(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_outbound_drain_preserves_order() {
        let bus = MessageBus::new();
        bus.publish_outbound(OutboundMessage::new("cli", "a", "one"));
        bus.publish_outbound(OutboundMessage::new("cli", "a", "two"));
        let drained: Vec<String> = bus.drain_outbound().into_iter().map(|m| m.content).collect();
        assert_eq!(drained, vec!["one", "two"]);
        assert!(bus.drain_outbound().is_empty());
    }
}
