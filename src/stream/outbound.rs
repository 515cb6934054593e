//! Outbound message dispatch: id assignment, envelope building, and routing
//! onto the stream socket or through the web API post path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::post_api::PostClient;
use crate::stream::proto::{Envelope, EventRecord, MessageBody};
use crate::stream::recent::RecentEvents;

/// How an outbound message leaves the client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Delivery {
    /// Write onto the live realtime socket. Requires a connection.
    Stream,
    /// One-shot web API post; richer formatting, independent of the socket.
    Rich,
}

/// Errors produced by outbound dispatch.
#[derive(Debug, Error)]
pub enum SendError {
    /// Stream delivery was requested without a live connection.
    #[error("no live gateway connection")]
    NotConnected,

    /// Caller-built envelope was not a JSON object.
    #[error("message envelope must be a JSON object")]
    InvalidEnvelope,

    /// Event offered to `respond` has no channel to target.
    #[error("event has no channel to respond into")]
    MissingChannel,

    /// The gateway worker is gone and can no longer accept frames.
    #[error("gateway worker is gone")]
    ChannelClosed,

    /// Envelope could not be serialized to a wire frame.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Cloneable handle for sending messages through a running gateway.
///
/// Every successfully validated call consumes exactly one id from the
/// per-instance monotonic counter, whatever the delivery path and whether or
/// not delivery ultimately succeeds.
#[derive(Clone)]
pub struct Messenger {
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
    post: PostClient,
    recent: Arc<Mutex<RecentEvents>>,
}

impl Messenger {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<String>,
        connected: Arc<AtomicBool>,
        next_id: Arc<AtomicU64>,
        post: PostClient,
        recent: Arc<Mutex<RecentEvents>>,
    ) -> Self {
        Self {
            outbound,
            connected,
            next_id,
            post,
            recent,
        }
    }

    /// Responds to a message event in its channel, threading by default.
    ///
    /// Returns `Ok(None)` without consuming an id when the event is not a
    /// message or already carries a reply marker.
    pub fn respond(
        &self,
        event: &EventRecord,
        body: impl Into<MessageBody>,
    ) -> Result<Option<u64>, SendError> {
        self.respond_via(event, body, true, Delivery::Stream)
    }

    /// Full-control variant of [`respond`](Self::respond).
    ///
    /// With `thread` set, the reply anchors to the event's existing thread or
    /// starts one on the event's own timestamp.
    pub fn respond_via(
        &self,
        event: &EventRecord,
        body: impl Into<MessageBody>,
        thread: bool,
        delivery: Delivery,
    ) -> Result<Option<u64>, SendError> {
        if event.event_type() != Some("message") || event.reply_to().is_some() {
            return Ok(None);
        }
        let channel = event.channel().ok_or(SendError::MissingChannel)?;

        let mut envelope = Envelope::new(channel, body.into());
        if thread {
            if let Some(anchor) = event.thread_ts().or_else(|| event.ts()) {
                envelope.set_thread_ts(anchor);
            }
        }
        self.dispatch(envelope, delivery).map(Some)
    }

    /// Sends a message to a channel over the stream.
    pub fn send(&self, body: impl Into<MessageBody>, channel: &str) -> Result<u64, SendError> {
        self.send_via(body, channel, Delivery::Stream)
    }

    /// Sends a message to a channel via the chosen delivery path.
    pub fn send_via(
        &self,
        body: impl Into<MessageBody>,
        channel: &str,
        delivery: Delivery,
    ) -> Result<u64, SendError> {
        self.dispatch(Envelope::new(channel, body.into()), delivery)
    }

    /// Lowest-level primitive: ships a caller-built envelope, injecting only
    /// the id. Non-object values are rejected.
    pub fn write(&self, envelope: Value) -> Result<u64, SendError> {
        self.write_via(envelope, Delivery::Stream)
    }

    /// Full-control variant of [`write`](Self::write).
    pub fn write_via(&self, envelope: Value, delivery: Delivery) -> Result<u64, SendError> {
        let envelope = Envelope::from_value(envelope).ok_or(SendError::InvalidEnvelope)?;
        self.dispatch(envelope, delivery)
    }

    /// Whether a live stream connection currently exists.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn dispatch(&self, mut envelope: Envelope, delivery: Delivery) -> Result<u64, SendError> {
        if delivery == Delivery::Stream && !self.is_connected() {
            return Err(SendError::NotConnected);
        }

        // Validation is done; the id is consumed from here on even if
        // delivery fails.
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        envelope.assign_id(id);

        match delivery {
            Delivery::Stream => {
                let frame = envelope.to_text()?;
                self.outbound
                    .send(frame)
                    .map_err(|_| SendError::ChannelClosed)?;
            }
            Delivery::Rich => {
                self.post
                    .spawn_post(envelope.into_value(), Arc::clone(&self.recent));
            }
        }

        Ok(id)
    }
}
