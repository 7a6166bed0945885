//! Point-to-point message bus between named contexts.
//!
//! ```text
//!   sender ── send(target, action) ──► route[target] (mpsc) ──► dispatcher
//!      ▲                                                          │
//!      └──────────────── oneshot Response ◄───────────────────────┘
//! ```
//!
//! Each context has at most one dispatcher.  Deliveries to a context are
//! processed one at a time in arrival order, so messages from one sender to
//! one target keep their send order.  A missing dispatcher is not an error:
//! the send resolves to `Reply::Undeliverable`.  The bus never retries.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, warn};

use crate::protocol::{Action, Context, Envelope, Reply, Response};

/// Bounded depth of a context mailbox.
pub const MAILBOX_CAPACITY: usize = 256;

/// Reply half of a delivery.  Notifications carry no reply channel.
pub struct Responder(Option<oneshot::Sender<Response>>);

impl Responder {
    pub fn respond(self, response: Response) {
        if let Some(tx) = self.0 {
            // Sender may have given up waiting; nothing to do then.
            let _ = tx.send(response);
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.0.is_some()
    }
}

pub struct Delivery {
    pub from: Context,
    pub action: Action,
    pub responder: Responder,
}

pub type Mailbox = mpsc::Receiver<Delivery>;
pub type MailboxSender = mpsc::Sender<Delivery>;

/// The single dispatcher of a context.
#[async_trait]
pub trait Handler: Send + 'static {
    async fn handle(&mut self, from: Context, action: Action) -> Response;
}

#[derive(Clone, Default)]
pub struct MessageBus {
    routes: Arc<RwLock<HashMap<Context, MailboxSender>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mailbox and make it the listener for `context`, replacing any
    /// previous one.
    pub async fn register(&self, context: Context) -> Mailbox {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.register_sender(context, tx).await;
        rx
    }

    /// Route `context` into an existing mailbox.  Several contexts may share
    /// one mailbox; they then share its ordering too.
    pub async fn register_sender(&self, context: Context, tx: MailboxSender) {
        debug!("bus: listener registered for {}", context);
        self.routes.write().await.insert(context, tx);
    }

    pub async fn unregister(&self, context: Context) {
        if self.routes.write().await.remove(&context).is_some() {
            debug!("bus: listener removed for {}", context);
        }
    }

    pub async fn is_listening(&self, context: Context) -> bool {
        match self.routes.read().await.get(&context) {
            Some(tx) => !tx.is_closed(),
            None => false,
        }
    }

    /// Register `handler` as the dispatcher of `context` and run it on its
    /// own task.  The task ends when the context is unregistered and every
    /// queued delivery has been answered.
    pub async fn on_message<H: Handler>(
        &self,
        context: Context,
        mut handler: H,
    ) -> tokio::task::JoinHandle<()> {
        let mut mailbox = self.register(context).await;
        tokio::spawn(async move {
            while let Some(delivery) = mailbox.recv().await {
                let response = handler.handle(delivery.from, delivery.action).await;
                delivery.responder.respond(response);
            }
            debug!("bus: dispatcher for {} exited", context);
        })
    }

    async fn route(&self, target: Context) -> Option<MailboxSender> {
        let tx = self.routes.read().await.get(&target).cloned()?;
        if tx.is_closed() {
            self.drop_closed(target).await;
            return None;
        }
        Some(tx)
    }

    async fn drop_closed(&self, target: Context) {
        let mut routes = self.routes.write().await;
        if routes.get(&target).is_some_and(|tx| tx.is_closed()) {
            routes.remove(&target);
            debug!("bus: dropped closed route to {}", target);
        }
    }

    /// Deliver `action` to `target` and wait for its response.
    pub async fn send(&self, from: Context, target: Context, action: Action) -> Reply {
        let Some(tx) = self.route(target).await else {
            debug!("bus: {} → {} undeliverable (no listener)", from, target);
            return Reply::Undeliverable;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let delivery = Delivery {
            from,
            action,
            responder: Responder(Some(reply_tx)),
        };
        if tx.send(delivery).await.is_err() {
            self.drop_closed(target).await;
            return Reply::Undeliverable;
        }

        match reply_rx.await {
            Ok(response) => Reply::Delivered(response),
            Err(_) => {
                debug!("bus: {} dropped a delivery from {} unanswered", target, from);
                Reply::Undeliverable
            }
        }
    }

    /// Route a wire envelope.  Unknown or malformed actions are answered with
    /// `Response::Ignored` without reaching the target.
    pub async fn send_envelope(&self, from: Context, envelope: Envelope) -> Reply {
        if !self.is_listening(envelope.target).await {
            return Reply::Undeliverable;
        }
        match envelope.action() {
            Ok(action) => self.send(from, envelope.target, action).await,
            Err(e) => {
                debug!("bus: {} → {}: {}", from, envelope.target, e);
                Reply::Delivered(Response::Ignored)
            }
        }
    }

    /// Fire-and-forget delivery.  Never blocks: a full or missing mailbox
    /// drops the message.  Returns whether it was queued.
    pub async fn notify(&self, from: Context, target: Context, action: Action) -> bool {
        let Some(tx) = self.route(target).await else {
            return false;
        };
        let delivery = Delivery {
            from,
            action,
            responder: Responder(None),
        };
        match tx.try_send(delivery) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("bus: mailbox of {} is full, notification dropped", target);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.drop_closed(target).await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PlaybackState;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&mut self, _from: Context, action: Action) -> Response {
            match action {
                Action::GetLastName => Response::Name(Some("fip".into())),
                Action::SetVolume(v) => Response::Volume(v.clamp(0, 100) as u8),
                _ => Response::Ignored,
            }
        }
    }

    #[tokio::test]
    async fn test_send_without_listener_is_undeliverable() {
        let bus = MessageBus::new();
        let reply = bus.send(Context::Background, Context::Popup, Action::GetStatus).await;
        assert!(reply.is_undeliverable());
        assert!(!bus.notify(Context::Background, Context::Popup, Action::GetStatus).await);
    }

    #[tokio::test]
    async fn test_request_response() {
        let bus = MessageBus::new();
        bus.on_message(Context::Background, Echo).await;
        let reply = bus.send(Context::Popup, Context::Background, Action::GetLastName).await;
        assert_eq!(reply, Reply::Delivered(Response::Name(Some("fip".into()))));
    }

    #[tokio::test]
    async fn test_unknown_envelope_action_is_ignored() {
        let bus = MessageBus::new();
        bus.on_message(Context::Background, Echo).await;
        let envelope = Envelope {
            target: Context::Background,
            action: "getAudioData".into(),
            data: serde_json::Value::Null,
        };
        let reply = bus.send_envelope(Context::Popup, envelope).await;
        assert_eq!(reply, Reply::Delivered(Response::Ignored));

        // The dispatcher is still alive afterwards.
        let reply = bus.send(Context::Popup, Context::Background, Action::SetVolume(140)).await;
        assert_eq!(reply, Reply::Delivered(Response::Volume(100)));
    }

    #[tokio::test]
    async fn test_dropped_listener_becomes_undeliverable() {
        let bus = MessageBus::new();
        let mailbox = bus.register(Context::Popup).await;
        drop(mailbox);
        let reply = bus.send(Context::Background, Context::Popup, Action::GetStatus).await;
        assert!(reply.is_undeliverable());
        assert!(!bus.is_listening(Context::Popup).await);
    }

    #[tokio::test]
    async fn test_unanswered_delivery_is_undeliverable() {
        let bus = MessageBus::new();
        let mut mailbox = bus.register(Context::Popup).await;
        tokio::spawn(async move {
            // Drop each delivery without responding.
            while let Some(delivery) = mailbox.recv().await {
                drop(delivery);
            }
        });
        let reply = bus.send(Context::Background, Context::Popup, Action::GetStatus).await;
        assert!(reply.is_undeliverable());
    }

    #[tokio::test]
    async fn test_notifications_keep_send_order() {
        let bus = MessageBus::new();
        let mut mailbox = bus.register(Context::Popup).await;
        let states = [
            PlaybackState::Buffering,
            PlaybackState::Playing,
            PlaybackState::Stopped,
            PlaybackState::Error,
        ];
        for state in states {
            let notice = crate::protocol::StateNotice {
                state,
                station: None,
                title: None,
            };
            assert!(
                bus.notify(Context::Background, Context::Popup, Action::StateChanged(notice))
                    .await
            );
        }
        for expected in states {
            let delivery = mailbox.recv().await.unwrap();
            assert!(!delivery.responder.expects_reply());
            match delivery.action {
                Action::StateChanged(n) => assert_eq!(n.state, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_shared_mailbox_for_two_contexts() {
        let bus = MessageBus::new();
        let (tx, mut rx) = mpsc::channel(8);
        bus.register_sender(Context::Background, tx.clone()).await;
        bus.register_sender(Context::Offscreen, tx).await;
        bus.notify(Context::Popup, Context::Offscreen, Action::Next).await;
        bus.notify(Context::Popup, Context::Background, Action::Prev).await;
        assert_eq!(rx.recv().await.unwrap().action, Action::Next);
        assert_eq!(rx.recv().await.unwrap().action, Action::Prev);
    }
}
