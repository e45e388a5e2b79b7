//! Channel lifecycle notifications.

use crate::core::message::Envelope;
use crate::error::ProtocolError;
use crate::service::channel::Channel;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receives a channel's lifecycle events.
///
/// Callbacks run on the channel's read task, in order, and must not block.
/// `on_closed` fires exactly once per channel that was started, whatever ended it.
pub trait ChannelObserver: Send + Sync {
    /// The handshake completed and the channel accepts `send`.
    fn on_handshaked(&self, _channel: &Channel) {}

    /// A message arrived and its handlers have already run.
    fn on_message(&self, _channel: &Channel, _envelope: &Envelope) {}

    /// The channel is gone; `cause` says why.
    fn on_closed(&self, _channel: &Channel, _cause: &ProtocolError) {}
}

/// One lifecycle event, as delivered by [`event_stream`].
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Handshaked(Channel),
    MessageReceived(Channel, Envelope),
    Closed(Channel, ProtocolError),
}

impl ChannelEvent {
    pub fn channel(&self) -> &Channel {
        match self {
            ChannelEvent::Handshaked(channel)
            | ChannelEvent::MessageReceived(channel, _)
            | ChannelEvent::Closed(channel, _) => channel,
        }
    }
}

struct Forwarder {
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelObserver for Forwarder {
    fn on_handshaked(&self, channel: &Channel) {
        let _ = self.tx.send(ChannelEvent::Handshaked(channel.clone()));
    }

    fn on_message(&self, channel: &Channel, envelope: &Envelope) {
        let _ = self
            .tx
            .send(ChannelEvent::MessageReceived(channel.clone(), envelope.clone()));
    }

    fn on_closed(&self, channel: &Channel, cause: &ProtocolError) {
        let _ = self
            .tx
            .send(ChannelEvent::Closed(channel.clone(), cause.clone()));
    }
}

/// An observer that turns callbacks into a stream of [`ChannelEvent`]s.
///
/// The queue is unbounded so the read task never waits on a slow consumer and
/// no event is dropped.
pub fn event_stream() -> (Arc<dyn ChannelObserver>, mpsc::UnboundedReceiver<ChannelEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Forwarder { tx }), rx)
}
