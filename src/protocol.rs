//! Blocking request/reply over the outbound and inbound queues.
//!
//! Replies are matched to requests purely by alternation: at most one
//! expect-reply envelope is outstanding at any time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::envelope::{Envelope, Inbound, NO_REPLY, SessionDescription};
use crate::error::{BridgeError, Result};
use crate::queue::{MessageQueue, QueueError};
use crate::transport::LinkState;

pub struct RequestReply {
    outbound: MessageQueue<Envelope>,
    inbound: MessageQueue<Inbound>,
    link: Arc<LinkState>,
    reply_timeout: Duration,
    reply_attempts: u32,
    awaiting_reply: bool,
    events: VecDeque<String>,
    hello: Option<String>,
}

impl RequestReply {
    pub fn new(
        outbound: MessageQueue<Envelope>,
        inbound: MessageQueue<Inbound>,
        link: Arc<LinkState>,
        reply_timeout: Duration,
        reply_attempts: u32,
    ) -> Self {
        Self {
            outbound,
            inbound,
            link,
            reply_timeout,
            reply_attempts: reply_attempts.max(1),
            awaiting_reply: false,
            events: VecDeque::new(),
            hello: None,
        }
    }

    /// Sends one envelope. With `expect_reply` the call blocks until the
    /// viewer answers and returns the raw reply text; otherwise it returns
    /// [`NO_REPLY`] immediately.
    pub fn send(&mut self, command: &str, payload: Value, expect_reply: bool) -> Result<String> {
        self.issue(Envelope::new(command, payload, expect_reply))?;
        if !expect_reply {
            return Ok(NO_REPLY.to_string());
        }
        self.wait_reply()
    }

    fn issue(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.expect_reply && self.awaiting_reply {
            return Err(BridgeError::ProtocolViolation(format!(
                "'{}' expects a reply while another reply is still outstanding",
                envelope.command
            )));
        }
        if !self.link.is_running() {
            return Err(BridgeError::PeerDisconnected);
        }
        let expect_reply = envelope.expect_reply;
        if !self.outbound.push(envelope) {
            return Err(BridgeError::PeerDisconnected);
        }
        if expect_reply {
            self.awaiting_reply = true;
        }
        Ok(())
    }

    /// Waits for the reply to the outstanding request. On `Timeout` the
    /// request stays outstanding and the wait may be retried.
    pub fn wait_reply(&mut self) -> Result<String> {
        if !self.awaiting_reply {
            return Err(BridgeError::ProtocolViolation(
                "no request is waiting for a reply".into(),
            ));
        }
        for attempt in 1..=self.reply_attempts {
            let deadline = Instant::now() + self.reply_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match self.inbound.pop(Some(remaining)) {
                    Ok(Inbound::Reply(reply)) => {
                        self.awaiting_reply = false;
                        return Ok(reply);
                    }
                    Ok(Inbound::Event(event)) => self.events.push_back(event),
                    Ok(Inbound::Hello(hello)) => {
                        debug!("viewer re-identified as {hello}");
                        self.hello = Some(hello);
                    }
                    Ok(Inbound::Offer(_)) => warn!("ignoring sdp offer received mid-session"),
                    Err(QueueError::Closed) => return Err(self.disconnected()),
                    Err(QueueError::Timeout) => break,
                }
            }
            if !self.link.is_running() {
                return Err(self.disconnected());
            }
            debug!("reply attempt {attempt}/{} timed out", self.reply_attempts);
        }
        Err(BridgeError::Timeout {
            what: "viewer reply",
            after: self.reply_timeout * self.reply_attempts,
        })
    }

    fn disconnected(&mut self) -> BridgeError {
        self.awaiting_reply = false;
        BridgeError::PeerDisconnected
    }

    /// Waits for the viewer's identification frame after connecting.
    pub fn wait_hello(&mut self, timeout: Duration) -> Result<String> {
        if let Some(hello) = self.hello.clone() {
            return Ok(hello);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inbound.pop(Some(remaining)) {
                Ok(Inbound::Hello(hello)) => {
                    self.hello = Some(hello.clone());
                    return Ok(hello);
                }
                Ok(Inbound::Event(event)) => self.events.push_back(event),
                Ok(other) => warn!("discarding {other:?} received before the viewer identified itself"),
                Err(QueueError::Closed) => return Err(BridgeError::PeerDisconnected),
                Err(QueueError::Timeout) => {
                    return Err(BridgeError::Timeout {
                        what: "viewer connection",
                        after: timeout,
                    });
                }
            }
        }
    }

    /// Waits for the viewer's SDP offer posted to the signaling route.
    pub fn wait_offer(&mut self, timeout: Duration) -> Result<SessionDescription> {
        match self.inbound.pop(Some(timeout)) {
            Ok(Inbound::Offer(offer)) => Ok(offer),
            Ok(other) => Err(BridgeError::Signaling(format!(
                "expected an sdp offer, got {other:?}"
            ))),
            Err(QueueError::Closed) => Err(BridgeError::PeerDisconnected),
            Err(QueueError::Timeout) => Err(BridgeError::Timeout {
                what: "sdp offer",
                after: timeout,
            }),
        }
    }

    /// Blocks up to `timeout` for the next event frame. Used by the pause wait.
    pub fn wait_event(&mut self, timeout: Duration) -> Result<Option<String>> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        match self.inbound.pop(Some(timeout)) {
            Ok(Inbound::Event(event)) => Ok(Some(event)),
            Ok(Inbound::Reply(reply)) => {
                warn!("dropping unexpected reply '{reply}' with no request outstanding");
                Ok(None)
            }
            Ok(_) => Ok(None),
            Err(QueueError::Timeout) => Ok(None),
            Err(QueueError::Closed) => Err(BridgeError::PeerDisconnected),
        }
    }

    /// All event frames received so far, in arrival order. Never blocks.
    pub fn take_events(&mut self) -> Vec<String> {
        let mut events: Vec<String> = self.events.drain(..).collect();
        while let Some(item) = self.inbound.try_pop() {
            match item {
                Inbound::Event(event) => events.push(event),
                Inbound::Hello(hello) => self.hello = Some(hello),
                other => debug!("dropping {other:?} outside a reply wait"),
            }
        }
        events
    }

    pub fn hello(&self) -> Option<&str> {
        self.hello.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_running()
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_reply
    }
}
