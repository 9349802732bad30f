//! Transports carrying envelopes between the queues and the viewer.
//!
//! Each transport runs on a dedicated thread with its own single-threaded
//! tokio runtime. The control thread only touches the two queues and the
//! shared [`LinkState`].

pub mod datachannel;
pub mod socket;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, Inbound};
use crate::error::Result;
use crate::queue::MessageQueue;

/// Lifecycle of a network service or peer link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkPhase {
    Idle = 0,
    Listening = 1,
    Negotiating = 2,
    Connected = 3,
    Closed = 4,
    Failed = 5,
}

impl LinkPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Listening,
            2 => Self::Negotiating,
            3 => Self::Connected,
            4 => Self::Closed,
            _ => Self::Failed,
        }
    }
}

/// Run flag plus lifecycle phase, shared between the control thread and a
/// service thread.
#[derive(Debug)]
pub struct LinkState {
    running: AtomicBool,
    phase: AtomicU8,
    shutdown: Notify,
}

impl LinkState {
    pub fn new(phase: LinkPhase) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            phase: AtomicU8::new(phase as u8),
            shutdown: Notify::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> LinkPhase {
        LinkPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: LinkPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Clears the run flag and wakes everything waiting in [`LinkState::stopped`].
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    pub fn fail(&self) {
        self.set_phase(LinkPhase::Failed);
        self.stop();
    }

    /// Resolves once the run flag is cleared.
    pub async fn stopped(&self) {
        loop {
            let notified = self.shutdown.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}

/// A connected viewer peer that exchanges text frames.
pub trait PeerLink: Send {
    fn send_text(&mut self, text: String) -> impl Future<Output = Result<()>> + Send;

    /// Next frame from the peer; `None` once the peer is gone.
    fn recv_text(&mut self) -> impl Future<Output = Option<String>> + Send;
}

/// Moves envelopes from `outbound` to the peer and frames from the peer to
/// `inbound` until the link drops or the run flag clears.
///
/// The first frame from the peer is its identification frame. After that,
/// the frame following an expect-reply envelope is its reply; any other
/// frame is an event.
pub async fn pump<L: PeerLink>(
    mut link: L,
    outbound: MessageQueue<Envelope>,
    inbound: MessageQueue<Inbound>,
    state: Arc<LinkState>,
) -> LinkPhase {
    let hello = tokio::select! {
        frame = link.recv_text() => frame,
        _ = state.stopped() => return finish(&inbound, &state, LinkPhase::Closed),
    };
    let Some(hello) = hello else {
        warn!("viewer disconnected before identifying itself");
        return finish(&inbound, &state, LinkPhase::Closed);
    };
    debug!("viewer identified: {hello}");
    inbound.push(Inbound::Hello(hello));
    state.set_phase(LinkPhase::Connected);

    let outcome = loop {
        tokio::select! {
            _ = state.stopped() => break LinkPhase::Closed,
            item = outbound.recv() => match item {
                None => break LinkPhase::Closed,
                Some(envelope) => {
                    let text = match envelope.to_wire() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!("dropping unserializable envelope '{}': {err}", envelope.command);
                            continue;
                        }
                    };
                    if let Err(err) = link.send_text(text).await {
                        info!("viewer send failed: {err}");
                        break LinkPhase::Closed;
                    }
                    if envelope.expect_reply {
                        let reply = tokio::select! {
                            frame = link.recv_text() => frame,
                            _ = state.stopped() => break LinkPhase::Closed,
                        };
                        match reply {
                            Some(reply) => {
                                inbound.push(Inbound::Reply(reply));
                            }
                            None => break LinkPhase::Closed,
                        }
                    }
                }
            },
            frame = link.recv_text() => match frame {
                Some(event) => {
                    inbound.push(Inbound::Event(event));
                }
                None => break LinkPhase::Closed,
            },
        }
    };
    if state.is_running() {
        info!("viewer disconnected");
    }
    finish(&inbound, &state, outcome)
}

fn finish(inbound: &MessageQueue<Inbound>, state: &LinkState, phase: LinkPhase) -> LinkPhase {
    // A failure recorded elsewhere (e.g. peer connection state) wins.
    let phase = if state.phase() == LinkPhase::Failed {
        LinkPhase::Failed
    } else {
        phase
    };
    state.set_phase(phase);
    state.stop();
    inbound.close();
    phase
}

/// A service thread that reports its own exit so it can be joined with a bound.
pub struct ServiceThread {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
    exited: std_mpsc::Receiver<()>,
}

impl ServiceThread {
    pub fn spawn(name: &'static str, body: impl FnOnce() + Send + 'static) -> Result<Self> {
        let (exit_tx, exited) = std_mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                body();
                let _ = exit_tx.send(());
            })?;
        Ok(Self {
            name,
            handle: Some(handle),
            exited,
        })
    }

    /// Waits up to `timeout` for the thread to finish. Returns false if it
    /// is still running, in which case it is left detached.
    pub fn join(mut self, timeout: Duration) -> bool {
        match self.exited.recv_timeout(timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take()
                    && handle.join().is_err()
                {
                    warn!("{} thread panicked", self.name);
                }
                true
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!("{} thread did not exit within {timeout:?}; detaching", self.name);
                false
            }
        }
    }
}

pub(crate) fn current_thread_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use crate::error::BridgeError;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// In-memory peer: frames sent by the bridge land in `sent`, frames
    /// pushed into `incoming` are what the peer "says".
    pub(crate) struct MemoryLink {
        pub sent: mpsc::UnboundedSender<String>,
        pub incoming: mpsc::UnboundedReceiver<String>,
    }

    impl PeerLink for MemoryLink {
        async fn send_text(&mut self, text: String) -> Result<()> {
            self.sent
                .send(text)
                .map_err(|_| BridgeError::PeerDisconnected)
        }

        async fn recv_text(&mut self) -> Option<String> {
            self.incoming.recv().await
        }
    }

    pub(crate) fn memory_link() -> (
        MemoryLink,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
    ) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        (
            MemoryLink {
                sent: sent_tx,
                incoming: peer_rx,
            },
            sent_rx,
            peer_tx,
        )
    }

    #[tokio::test]
    async fn pump_routes_replies_and_events() {
        let (link, mut sent, peer) = memory_link();
        let outbound = MessageQueue::new();
        let inbound = MessageQueue::new();
        let state = LinkState::new(LinkPhase::Listening);
        let task = tokio::spawn(pump(link, outbound.clone(), inbound.clone(), state.clone()));

        peer.send("Connected".into()).unwrap();
        outbound.push(Envelope::new("sim_time", json!(0.5), false));
        outbound.push(Envelope::new("shape", json!({}), true));

        assert_eq!(sent.recv().await.unwrap(), r#"[false,["sim_time",0.5]]"#);
        assert_eq!(sent.recv().await.unwrap(), r#"[true,["shape",{}]]"#);
        peer.send("7".into()).unwrap();
        peer.send(r#"{"elementId":"0","value":1}"#.into()).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(inbound.recv().await.unwrap());
        }
        assert_eq!(seen[0], Inbound::Hello("Connected".into()));
        assert_eq!(seen[1], Inbound::Reply("7".into()));
        assert_eq!(seen[2], Inbound::Event(r#"{"elementId":"0","value":1}"#.into()));
        assert_eq!(state.phase(), LinkPhase::Connected);

        state.stop();
        assert_eq!(task.await.unwrap(), LinkPhase::Closed);
        assert!(inbound.is_closed());
    }

    #[tokio::test]
    async fn pump_closes_inbound_when_peer_leaves() {
        let (link, _sent, peer) = memory_link();
        let outbound = MessageQueue::new();
        let inbound = MessageQueue::new();
        let state = LinkState::new(LinkPhase::Listening);
        peer.send("Connected".into()).unwrap();
        drop(peer);

        let phase = pump(link, outbound, inbound.clone(), state.clone()).await;
        assert_eq!(phase, LinkPhase::Closed);
        assert!(!state.is_running());
        assert_eq!(inbound.try_pop(), Some(Inbound::Hello("Connected".into())));
        assert!(inbound.is_closed());
    }

    #[tokio::test]
    async fn recorded_failure_survives_teardown() {
        let (link, _sent, _peer) = memory_link();
        let state = LinkState::new(LinkPhase::Negotiating);
        state.fail();
        let phase = pump(link, MessageQueue::new(), MessageQueue::new(), state).await;
        assert_eq!(phase, LinkPhase::Failed);
    }

    #[test]
    fn service_thread_joins_within_bound() {
        let thread = ServiceThread::spawn("test-service", || {
            std::thread::sleep(Duration::from_millis(10));
        })
        .unwrap();
        assert!(thread.join(Duration::from_secs(2)));
    }
}
