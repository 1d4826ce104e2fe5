use std::future::Future;
use std::sync::Arc;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::message::{Message, MessageKind};

/// [`MessageHandler`] receives delivered messages of the kinds it is
/// registered for.
///
/// The message's sender has already been verified by the transport it
/// arrived on.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        FnHandler(handler)
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self.0)(message).await
    }
}

/// Fallback for kinds nobody registered: logged and dropped.
struct DropHandler;

#[async_trait]
impl MessageHandler for DropHandler {
    async fn handle(&self, message: Message) -> Result<()> {
        debug!(kind = %message.kind(), sender = ?message.sender(), "no handler registered, dropping message");
        Ok(())
    }
}

/// Table of message kind to handler, with a default for everything else.
pub struct MessageDispatcher {
    handlers: DashMap<MessageKind, Arc<dyn MessageHandler>>,
    default_handler: RwLock<Arc<dyn MessageHandler>>,
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            default_handler: RwLock::new(Arc::new(DropHandler)),
        }
    }

    /// Registers `handler` for `kind`, returning the handler it replaced.
    pub fn register(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.insert(kind, handler)
    }

    pub fn unregister(&self, kind: MessageKind) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.remove(&kind).map(|(_, handler)| handler)
    }

    pub fn set_default_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.default_handler.write() = handler;
    }

    pub fn is_registered(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub async fn dispatch(&self, message: Message) -> Result<()> {
        // clone the handler out so no map guard is held across the await
        let handler = self.handlers
            .get(&message.kind())
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.default_handler.read().clone());
        handler.handle(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn recording_handler(tag: &'static str, tx: mpsc::UnboundedSender<(&'static str, MessageKind)>) -> Arc<dyn MessageHandler> {
        Arc::new(FnHandler::new(move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((tag, message.kind()));
                Ok(())
            }
        }))
    }

    #[tokio::test]
    async fn test_dispatches_by_kind_with_default_fallback() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = MessageDispatcher::new();
        dispatcher.register(MessageKind::Application(1), recording_handler("app", tx.clone()));
        dispatcher.set_default_handler(recording_handler("default", tx));

        dispatcher.dispatch(Message::application(1, vec![1]).unwrap()).await.unwrap();
        dispatcher.dispatch(Message::application(2, vec![2]).unwrap()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), ("app", MessageKind::Application(1)));
        assert_eq!(rx.recv().await.unwrap(), ("default", MessageKind::Application(2)));
    }

    #[tokio::test]
    async fn test_unregistered_kinds_are_dropped_quietly() {
        let dispatcher = MessageDispatcher::new();
        assert!(dispatcher.dispatch(Message::application(5, vec![]).unwrap()).await.is_ok());

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(dispatcher.register(MessageKind::Application(5), recording_handler("a", tx.clone())).is_none());
        assert!(dispatcher.register(MessageKind::Application(5), recording_handler("b", tx)).is_some());
        assert!(dispatcher.unregister(MessageKind::Application(5)).is_some());
        assert!(!dispatcher.is_registered(MessageKind::Application(5)));
    }
}
