//! Peer-to-peer data channel transport.
//!
//! There is no listening socket. The viewer posts an SDP offer to the
//! bootstrap server, the control thread hands it to [`DataChannelTransport::negotiate`],
//! and the answer travels back the same way. Once ICE reports connected and
//! the viewer's channel opens, the transport runs the same pump as the
//! socket transport, with sends paced by the channel's buffered byte count.

use std::future::Future;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use webrtc::api::{API, APIBuilder};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{LinkPhase, LinkState, PeerLink, ServiceThread, current_thread_runtime, pump};
use crate::envelope::{Envelope, Inbound, SessionDescription};
use crate::error::{BridgeError, Result};
use crate::queue::MessageQueue;

#[derive(Clone, Copy, Debug)]
pub struct DataChannelSettings {
    pub handshake_timeout: Duration,
    pub backpressure_threshold: usize,
    pub backpressure_poll: Duration,
}

struct NegotiateRequest {
    offer: SessionDescription,
    reply: std_mpsc::SyncSender<Result<SessionDescription>>,
}

pub struct DataChannelTransport {
    pub state: Arc<LinkState>,
    negotiator: mpsc::UnboundedSender<NegotiateRequest>,
    thread: ServiceThread,
}

impl DataChannelTransport {
    pub fn spawn(
        outbound: MessageQueue<Envelope>,
        inbound: MessageQueue<Inbound>,
        settings: DataChannelSettings,
    ) -> Result<Self> {
        let runtime = current_thread_runtime()?;
        let state = LinkState::new(LinkPhase::Idle);
        let (negotiator, requests) = mpsc::unbounded_channel();
        let task_state = state.clone();
        let thread = ServiceThread::spawn("scenelink-datachannel", move || {
            runtime.block_on(run(requests, outbound, inbound, task_state, settings));
        })?;
        Ok(Self {
            state,
            negotiator,
            thread,
        })
    }

    pub fn phase(&self) -> LinkPhase {
        self.state.phase()
    }

    /// Turns the viewer's offer into a local answer. Blocks the calling
    /// thread for at most `timeout`.
    pub fn negotiate(
        &self,
        offer: SessionDescription,
        timeout: Duration,
    ) -> Result<SessionDescription> {
        let (reply, answer) = std_mpsc::sync_channel(1);
        self.negotiator
            .send(NegotiateRequest { offer, reply })
            .map_err(|_| BridgeError::Signaling("data channel transport is not accepting offers".into()))?;
        match answer.recv_timeout(timeout) {
            Ok(result) => result,
            Err(std_mpsc::RecvTimeoutError::Timeout) => Err(BridgeError::Timeout {
                what: "sdp answer",
                after: timeout,
            }),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(BridgeError::Signaling(
                "data channel transport exited during negotiation".into(),
            )),
        }
    }

    pub fn into_thread(self) -> ServiceThread {
        self.thread
    }
}

async fn run(
    mut requests: mpsc::UnboundedReceiver<NegotiateRequest>,
    outbound: MessageQueue<Envelope>,
    inbound: MessageQueue<Inbound>,
    state: Arc<LinkState>,
    settings: DataChannelSettings,
) {
    let request = tokio::select! {
        request = requests.recv() => request,
        _ = state.stopped() => None,
    };
    // Later offers find the receiver gone and fail fast.
    drop(requests);
    let Some(request) = request else {
        close_idle(&inbound, &state);
        return;
    };
    state.set_phase(LinkPhase::Negotiating);

    let peer = match PeerSetup::new(state.clone()).await {
        Ok(peer) => peer,
        Err(err) => {
            error!("failed to create peer connection: {err}");
            let _ = request.reply.send(Err(err));
            state.fail();
            inbound.close();
            return;
        }
    };
    match peer.answer(request.offer).await {
        Ok(answer) => {
            let _ = request.reply.send(Ok(answer));
        }
        Err(err) => {
            error!("sdp negotiation failed: {err}");
            let _ = request.reply.send(Err(err));
            peer.close().await;
            state.fail();
            inbound.close();
            return;
        }
    }

    let PeerSetup {
        connection,
        mut ice,
        mut opened,
        frames,
    } = peer;
    let channel = tokio::select! {
        channel = wait_connected(&mut ice, &mut opened, settings.handshake_timeout) => channel,
        _ = state.stopped() => None,
    };
    let Some(channel) = channel else {
        warn!(
            "data channel did not open within {:?}",
            settings.handshake_timeout
        );
        state.fail();
        inbound.close();
        close_connection(&connection).await;
        return;
    };
    info!("data channel '{}' open", channel.label());

    let link = DataChannelLink {
        channel,
        frames,
        state: state.clone(),
        threshold: settings.backpressure_threshold,
        poll: settings.backpressure_poll,
    };
    let phase = pump(link, outbound, inbound, state).await;
    info!("data channel session ended: phase={phase:?}");
    close_connection(&connection).await;
}

fn close_idle(inbound: &MessageQueue<Inbound>, state: &LinkState) {
    if state.phase() != LinkPhase::Failed {
        state.set_phase(LinkPhase::Closed);
    }
    state.stop();
    inbound.close();
}

async fn close_connection(connection: &RTCPeerConnection) {
    if let Err(err) = connection.close().await {
        debug!("peer connection close failed: {err}");
    }
}

async fn wait_connected(
    ice: &mut watch::Receiver<RTCIceConnectionState>,
    opened: &mut mpsc::UnboundedReceiver<Arc<RTCDataChannel>>,
    timeout: Duration,
) -> Option<Arc<RTCDataChannel>> {
    tokio::time::timeout(timeout, async {
        ice.wait_for(|state| {
            matches!(
                state,
                RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
            )
        })
        .await
        .ok()?;
        opened.recv().await
    })
    .await
    .ok()
    .flatten()
}

/// A peer connection with its callbacks wired to channels.
struct PeerSetup {
    connection: Arc<RTCPeerConnection>,
    ice: watch::Receiver<RTCIceConnectionState>,
    opened: mpsc::UnboundedReceiver<Arc<RTCDataChannel>>,
    frames: mpsc::UnboundedReceiver<Option<String>>,
}

fn peer_api() -> Result<API> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media)?;
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

impl PeerSetup {
    async fn new(state: Arc<LinkState>) -> Result<Self> {
        let api = peer_api()?;
        let connection = Arc::new(api.new_peer_connection(RTCConfiguration::default()).await?);

        let (ice_tx, ice) = watch::channel(RTCIceConnectionState::New);
        connection.on_ice_connection_state_change(Box::new(move |ice_state| {
            debug!("ice connection state: {ice_state}");
            let _ = ice_tx.send(ice_state);
            Box::pin(async {})
        }));

        connection.on_peer_connection_state_change(Box::new(move |peer_state| {
            info!("peer connection state: {peer_state}");
            // Closing our own connection after teardown is not a failure.
            if state.is_running()
                && matches!(
                    peer_state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                )
            {
                state.fail();
            }
            Box::pin(async {})
        }));

        let (open_tx, opened) = mpsc::unbounded_channel();
        let (frame_tx, frames) = mpsc::unbounded_channel();
        connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let open_tx = open_tx.clone();
            let frame_tx = frame_tx.clone();
            Box::pin(async move {
                debug!("viewer announced data channel '{}'", channel.label());
                let opened_channel = channel.clone();
                channel.on_open(Box::new(move || {
                    let _ = open_tx.send(opened_channel);
                    Box::pin(async {})
                }));
                let message_tx = frame_tx.clone();
                channel.on_message(Box::new(move |message: DataChannelMessage| {
                    let text = String::from_utf8_lossy(&message.data).into_owned();
                    let _ = message_tx.send(Some(text));
                    Box::pin(async {})
                }));
                channel.on_close(Box::new(move || {
                    let _ = frame_tx.send(None);
                    Box::pin(async {})
                }));
            })
        }));

        Ok(Self {
            connection,
            ice,
            opened,
            frames,
        })
    }

    async fn answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        if offer.kind != "offer" {
            return Err(BridgeError::Signaling(format!(
                "expected an sdp offer, got '{}'",
                offer.kind
            )));
        }
        let remote = RTCSessionDescription::offer(offer.sdp)?;
        self.connection.set_remote_description(remote).await?;
        let answer = self.connection.create_answer(None).await?;
        let mut gathered = self.connection.gathering_complete_promise().await;
        self.connection.set_local_description(answer).await?;
        let _ = gathered.recv().await;
        let local = self
            .connection
            .local_description()
            .await
            .ok_or_else(|| BridgeError::Signaling("no local description after gathering".into()))?;
        debug!("ice gathering complete; answering viewer");
        Ok(SessionDescription {
            sdp: local.sdp,
            kind: local.sdp_type.to_string(),
        })
    }

    async fn close(&self) {
        close_connection(&self.connection).await;
    }
}

/// A send/receive channel that reports how many bytes it still holds.
pub trait BufferedChannel: Send + Sync {
    fn buffered_amount(&self) -> impl Future<Output = usize> + Send;
    fn send(&self, text: String) -> impl Future<Output = Result<()>> + Send;
}

impl BufferedChannel for Arc<RTCDataChannel> {
    async fn buffered_amount(&self) -> usize {
        RTCDataChannel::buffered_amount(self).await
    }

    async fn send(&self, text: String) -> Result<()> {
        self.send_text(text).await?;
        Ok(())
    }
}

pub struct DataChannelLink<C> {
    channel: C,
    frames: mpsc::UnboundedReceiver<Option<String>>,
    state: Arc<LinkState>,
    threshold: usize,
    poll: Duration,
}

impl<C: BufferedChannel> DataChannelLink<C> {
    /// Sleeps in `poll` steps while the channel holds more than `threshold` bytes.
    async fn drain_backlog(&self) -> Result<()> {
        let mut waited = false;
        loop {
            let buffered = self.channel.buffered_amount().await;
            if buffered <= self.threshold {
                return Ok(());
            }
            if !self.state.is_running() {
                return Err(BridgeError::PeerDisconnected);
            }
            if !waited {
                debug!("data channel holds {buffered} bytes; waiting to send");
                waited = true;
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

impl<C: BufferedChannel> PeerLink for DataChannelLink<C> {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.drain_backlog().await?;
        self.channel.send(text).await
    }

    async fn recv_text(&mut self) -> Option<String> {
        self.frames.recv().await.flatten()
    }
}
