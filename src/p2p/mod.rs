use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::error::Result;
use crate::model::message::Topic;
use crate::model::NodeId;

/// Payload of one bus message. Typed messages are serialized through
/// `serde_json` so a handler can decode the prototype it registered for.
pub type MessageValue = serde_json::Value;

/// Callback invoked for every message delivered on a topic.
pub type MessageHandler =
    Box<dyn Fn(NodeId, MessageValue) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Best-effort sender half of the peer-to-peer message bus.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Non-blocking send of `message` to `(node, topic)`. `Ok(false)` means
    /// the message was not delivered and the caller may retry later.
    async fn send_to_node(
        &self,
        node: &NodeId,
        topic: &Topic,
        message: MessageValue,
    ) -> Result<bool>;
}

/// Receiver half: topic registration for the local node.
#[async_trait]
pub trait MessageRouter: Send + Sync {
    /// Returns `false` if the topic already has a handler.
    async fn register_handler(&self, topic: Topic, handler: MessageHandler) -> Result<bool>;

    /// Returns `false` if no handler was registered for the topic.
    async fn unregister_handler(&self, topic: &Topic) -> Result<bool>;
}

/// In-process message bus connecting every participant of one process.
///
/// Delivery is synchronous with the send: the registered handler runs before
/// `send_to_node` returns. A send to a topic nobody listens on reports
/// `Ok(false)`, like a real bus dropping a message for a gone peer. The
/// `node` argument is forwarded to the handler as the peer node, which lets
/// a test script a worker pinging "from" its executor node.
#[derive(Default)]
pub struct LocalMessageBus {
    handlers: RwLock<HashMap<Topic, Arc<MessageHandler>>>,
}

impl LocalMessageBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageSender for LocalMessageBus {
    async fn send_to_node(
        &self,
        node: &NodeId,
        topic: &Topic,
        message: MessageValue,
    ) -> Result<bool> {
        let handler = match self.handlers.read().get(topic) {
            Some(h) => Arc::clone(h),
            None => {
                tracing::debug!(node = %node, topic = %topic, "no handler for topic, message dropped");
                return Ok(false);
            }
        };
        (handler.as_ref())(node.clone(), message).await?;
        Ok(true)
    }
}

#[async_trait]
impl MessageRouter for LocalMessageBus {
    async fn register_handler(&self, topic: Topic, handler: MessageHandler) -> Result<bool> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&topic) {
            return Ok(false);
        }
        handlers.insert(topic, Arc::new(handler));
        Ok(true)
    }

    async fn unregister_handler(&self, topic: &Topic) -> Result<bool> {
        Ok(self.handlers.write().remove(topic).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_send_without_handler_is_not_delivered() {
        let bus = LocalMessageBus::new();
        let delivered = bus
            .send_to_node(&"n1".to_owned(), &"t".to_owned(), serde_json::json!({}))
            .await
            .unwrap();
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_register_and_deliver() {
        let bus = LocalMessageBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = hits.clone();
        let registered = bus
            .register_handler(
                "t".to_owned(),
                Box::new(move |_from, _msg| {
                    let hits = hits2.clone();
                    Box::pin(async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
            )
            .await
            .unwrap();
        assert!(registered);

        let delivered = bus
            .send_to_node(&"n1".to_owned(), &"t".to_owned(), serde_json::json!({}))
            .await
            .unwrap();
        assert!(delivered);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_reports_false() {
        let bus = LocalMessageBus::new();
        let noop = || -> MessageHandler { Box::new(|_, _| Box::pin(async { Ok(()) })) };

        assert!(bus.register_handler("t".to_owned(), noop()).await.unwrap());
        assert!(!bus.register_handler("t".to_owned(), noop()).await.unwrap());

        assert!(bus.unregister_handler(&"t".to_owned()).await.unwrap());
        assert!(!bus.unregister_handler(&"t".to_owned()).await.unwrap());
    }
}
