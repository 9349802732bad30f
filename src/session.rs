//! The bridge as seen by the control thread.
//!
//! A [`Session`] owns the queues, the active transport, the bootstrap server
//! and all control-side state. Every method is synchronous.

use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::bootstrap::{BootstrapServer, Signaling};
use crate::config::{BridgeConfig, TransportKind};
use crate::elements::{ElementCallback, ElementKind, ElementRegistry};
use crate::envelope::{Envelope, NO_REPLY, parse_events};
use crate::error::{BridgeError, Result};
use crate::port::{PortBinder, ProtocolKind};
use crate::protocol::RequestReply;
use crate::queue::MessageQueue;
use crate::render::{ControlToggle, Pacing, PausePoll, RenderLoop};
use crate::scene::{ManagedObject, SceneObject, pose_batch};
use crate::transport::datachannel::{DataChannelSettings, DataChannelTransport};
use crate::transport::socket::SocketTransport;
use crate::transport::{LinkState, ServiceThread};

enum Transport {
    Socket(SocketTransport),
    DataChannel(DataChannelTransport),
}

impl Transport {
    fn state(&self) -> &std::sync::Arc<LinkState> {
        match self {
            Transport::Socket(transport) => &transport.state,
            Transport::DataChannel(transport) => &transport.state,
        }
    }

    fn into_thread(self) -> ServiceThread {
        match self {
            Transport::Socket(transport) => transport.into_thread(),
            Transport::DataChannel(transport) => transport.into_thread(),
        }
    }
}

/// Everything that exists only while a viewer is attached.
struct Link {
    protocol: RequestReply,
    outbound: MessageQueue<Envelope>,
    signaling: Option<Signaling>,
    transport: Transport,
    bootstrap: BootstrapServer,
}

impl Link {
    fn teardown(self, timeout: Duration) {
        self.transport.state().stop();
        self.bootstrap.state.stop();
        // Blocked signaling requests would hold up the server's shutdown.
        self.outbound.close();
        if let Some(signaling) = &self.signaling {
            signaling.close();
        }
        let transport = self.transport.into_thread();
        let bootstrap = self.bootstrap.into_thread();
        let transport_joined = transport.join(timeout);
        let bootstrap_joined = bootstrap.join(timeout);
        if transport_joined && bootstrap_joined {
            info!("viewer link closed");
        }
    }
}

pub struct Session {
    config: BridgeConfig,
    link: Option<Link>,
    url: Option<String>,
    registry: ElementRegistry,
    render: RenderLoop,
    objects: Vec<ManagedObject>,
    sim_time: f64,
    next_local_id: u64,
}

impl Session {
    /// A session without a viewer: `step` only integrates.
    pub fn headless() -> Self {
        let mut session = Self::detached(BridgeConfig::default());
        session.render.set_rendering(false);
        session
    }

    fn detached(config: BridgeConfig) -> Self {
        let render = RenderLoop::new(
            config.frame_budget(),
            config.realtime,
            config.pause_wake_interval,
        );
        Self {
            config,
            link: None,
            url: None,
            registry: ElementRegistry::new(),
            render,
            objects: Vec::new(),
            sim_time: 0.0,
            next_local_id: 0,
        }
    }

    /// Binds the transport and the bootstrap server, opens the viewer page
    /// and blocks until the viewer has connected.
    pub fn launch(config: BridgeConfig) -> Result<Self> {
        match Self::try_launch(config) {
            Ok(session) => Ok(session),
            Err(err) => {
                error!("viewer launch failed: {err}");
                Err(err)
            }
        }
    }

    fn try_launch(config: BridgeConfig) -> Result<Self> {
        let outbound = MessageQueue::new();
        let inbound = MessageQueue::new();

        let (transport, token) = match config.transport {
            TransportKind::Socket => {
                let binder =
                    PortBinder::new(config.host.clone(), config.socket_ports, config.bind_budget);
                let (endpoint, transport) =
                    binder.bind_with(ProtocolKind::WebSocket, |listener, endpoint| {
                        SocketTransport::spawn(listener, endpoint, outbound.clone(), inbound.clone())
                    })?;
                (Transport::Socket(transport), Some(endpoint.token()))
            }
            TransportKind::DataChannel => {
                let transport = DataChannelTransport::spawn(
                    outbound.clone(),
                    inbound.clone(),
                    DataChannelSettings {
                        handshake_timeout: config.handshake_timeout,
                        backpressure_threshold: config.backpressure_threshold,
                        backpressure_poll: config.backpressure_poll,
                    },
                )?;
                (Transport::DataChannel(transport), None)
            }
        };

        let signaling = matches!(transport, Transport::DataChannel(_))
            .then(|| Signaling::new(inbound.clone(), config.handshake_timeout));
        let binder = PortBinder::new(config.host.clone(), config.http_ports, config.bind_budget);
        let bootstrap = match binder.bind_with(ProtocolKind::Http, |listener, endpoint| {
            BootstrapServer::spawn(listener, endpoint, token, signaling.clone())
        }) {
            Ok((_, bootstrap)) => bootstrap,
            Err(err) => {
                transport.state().stop();
                transport.into_thread().join(config.teardown_timeout);
                return Err(err);
            }
        };

        let protocol = RequestReply::new(
            outbound.clone(),
            inbound,
            transport.state().clone(),
            config.reply_timeout,
            config.reply_attempts,
        );
        let url = bootstrap.url().to_string();
        let mut session = Self::detached(config);
        session.url = Some(url.clone());
        session.link = Some(Link {
            protocol,
            outbound,
            signaling,
            transport,
            bootstrap,
        });

        if session.config.open_tab {
            open_viewer(&url, session.config.browser.as_deref());
        } else {
            info!("open {url} to attach a viewer");
        }
        // Dropping the session on error tears the link down.
        session.handshake()?;
        Ok(session)
    }

    fn handshake(&mut self) -> Result<()> {
        let timeout = self.config.handshake_timeout;
        let link = self.link_mut()?;
        if let (Transport::DataChannel(transport), Some(signaling)) =
            (&link.transport, &link.signaling)
        {
            let offer = link.protocol.wait_offer(timeout)?;
            let answer = transport.negotiate(offer, timeout)?;
            signaling.answer(answer)?;
        }
        let hello = link.protocol.wait_hello(timeout)?;
        info!("viewer attached: {hello}");
        Ok(())
    }

    fn link_mut(&mut self) -> Result<&mut Link> {
        self.link.as_mut().ok_or(BridgeError::PeerDisconnected)
    }

    /// URL of the viewer page, if a viewer link exists.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn sim_time(&self) -> f64 {
        self.sim_time
    }

    pub fn render(&self) -> &RenderLoop {
        &self.render
    }

    pub fn registry(&self) -> &ElementRegistry {
        &self.registry
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.protocol.is_connected())
    }

    /// Advances the simulation by `dt` and, when paced to, pushes poses to
    /// the viewer and handles its events.
    pub fn step(&mut self, dt: f64) -> Result<()> {
        for managed in &mut self.objects {
            managed.object.integrate(dt)?;
        }
        self.sim_time += dt;

        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        if !self.render.state().rendering {
            let toggles = route_events(link.protocol.take_events(), &mut self.registry);
            self.render.apply_all(toggles);
            return Ok(());
        }
        if !link.protocol.is_connected() {
            return Err(BridgeError::PeerDisconnected);
        }
        let Pacing::Push { frames } = self.render.pace(dt) else {
            return Ok(());
        };

        for descriptor in self.registry.take_changed() {
            link.protocol.send("update_element", descriptor, false)?;
        }
        let reply = link
            .protocol
            .send("shape_poses", pose_batch(&self.objects, frames), true)?;
        let mut events = link.protocol.take_events();
        events.push(reply);
        let toggles = route_events(events, &mut self.registry);
        self.render.apply_all(toggles);
        link.protocol
            .send("sim_time", json!(self.sim_time), false)?;

        if self.render.state().paused {
            let started = Instant::now();
            let mut viewer = ViewerPoll {
                protocol: &mut link.protocol,
                registry: &mut self.registry,
            };
            let polls = self.render.hold_while_paused(&mut viewer)?;
            debug!("pause held for {polls} polls over {:?}", started.elapsed());
        }
        Ok(())
    }

    /// Adds an object to the scene; returns the id the viewer assigned.
    pub fn add(&mut self, descriptor: Value, object: SceneObject) -> Result<String> {
        let id = match self.link.as_mut() {
            Some(link) => {
                let reply = link.protocol.send("shape", descriptor.clone(), true)?;
                reply_id(&reply)
            }
            None => {
                let id = self.next_local_id.to_string();
                self.next_local_id += 1;
                id
            }
        };
        self.objects.push(ManagedObject {
            id: id.clone(),
            descriptor,
            object,
        });
        Ok(id)
    }

    pub fn remove(&mut self, id: &str) -> Result<bool> {
        let before = self.objects.len();
        self.objects.retain(|managed| managed.id != id);
        let removed = self.objects.len() != before;
        if removed {
            self.send_command("remove", json!(id), false)?;
        }
        Ok(removed)
    }

    pub fn object_mut(&mut self, id: &str) -> Option<&mut SceneObject> {
        self.objects
            .iter_mut()
            .find(|managed| managed.id == id)
            .map(|managed| &mut managed.object)
    }

    pub fn objects(&self) -> &[ManagedObject] {
        &self.objects
    }

    /// Attaches a UI element. `callback` runs on the control thread whenever
    /// the viewer reports a new value for it.
    pub fn add_element(
        &mut self,
        kind: ElementKind,
        callback: Option<ElementCallback>,
    ) -> Result<String> {
        let id = self.registry.add(kind, callback);
        if let Some(element) = self.registry.get(&id) {
            let descriptor = element.descriptor();
            self.send_command("element", descriptor, false)?;
        }
        Ok(id)
    }

    /// Edits an element; the viewer sees the change on the next push.
    pub fn update_element(&mut self, id: &str, edit: impl FnOnce(&mut ElementKind)) -> bool {
        self.registry.update(id, edit)
    }

    /// Whether the viewer has finished loading the object's geometry.
    pub fn is_mounted(&mut self, id: &str) -> Result<bool> {
        if self.link.is_none() {
            return Ok(true);
        }
        let reply = self.send_command("shape_mounted", json!(id), true)?;
        Ok(reply.trim() == "1")
    }

    pub fn start_recording(&mut self, frame_rate: f64, name: &str, format: &str) -> Result<()> {
        self.send_command("start_recording", json!([frame_rate, name, format]), false)?;
        Ok(())
    }

    pub fn stop_recording(&mut self) -> Result<()> {
        self.send_command("stop_recording", json!({}), false)?;
        Ok(())
    }

    pub fn screenshot(&mut self, name: &str) -> Result<()> {
        self.send_command("screenshot", json!(name), false)?;
        Ok(())
    }

    pub fn set_camera_pose(&mut self, position: [f64; 3], look_at: [f64; 3]) -> Result<()> {
        self.send_command(
            "set_camera_pose",
            json!({ "position": position, "look_at": look_at }),
            false,
        )?;
        Ok(())
    }

    /// Sends an arbitrary command. Without a viewer this is a no-op that
    /// returns the no-reply sentinel.
    pub fn send_command(&mut self, command: &str, payload: Value, expect_reply: bool) -> Result<String> {
        match self.link.as_mut() {
            Some(link) => link.protocol.send(command, payload, expect_reply),
            None => Ok(NO_REPLY.to_string()),
        }
    }

    /// Tells the viewer to close, then stops the transport and the
    /// bootstrap server within the teardown timeout.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };
        let result = if link.protocol.hello().is_some() && link.protocol.is_connected() {
            let sent = link.protocol.send("close", json!({}), false).map(|_| ());
            flush(&link.outbound, self.config.teardown_timeout);
            sent
        } else {
            Ok(())
        };
        link.teardown(self.config.teardown_timeout);
        self.registry.clear();
        self.url = None;
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            debug!("session teardown: {err}");
        }
    }
}

/// Gives the transport a bounded chance to send what is already queued.
fn flush(outbound: &MessageQueue<Envelope>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !outbound.is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    // The last frame may still be in the socket write.
    std::thread::sleep(Duration::from_millis(20));
}

/// Dispatches element events and returns the session-control toggles.
fn route_events(frames: Vec<String>, registry: &mut ElementRegistry) -> Vec<ControlToggle> {
    let mut toggles = Vec::new();
    for frame in frames {
        for event in parse_events(&frame) {
            match ControlToggle::from_event(&event) {
                Some(toggle) => toggles.push(toggle),
                None => {
                    registry.dispatch(&event);
                }
            }
        }
    }
    toggles
}

fn reply_id(reply: &str) -> String {
    match serde_json::from_str::<Value>(reply) {
        Ok(Value::String(id)) => id,
        Ok(Value::Number(id)) => id.to_string(),
        _ => reply.trim().to_string(),
    }
}

struct ViewerPoll<'a> {
    protocol: &'a mut RequestReply,
    registry: &'a mut ElementRegistry,
}

impl PausePoll for ViewerPoll<'_> {
    fn poll(&mut self) -> Result<Vec<ControlToggle>> {
        let reply = self.protocol.send("check_elements", json!({}), true)?;
        let mut events = self.protocol.take_events();
        events.push(reply);
        Ok(route_events(events, self.registry))
    }

    fn wait(&mut self, timeout: Duration) -> Result<Vec<ControlToggle>> {
        match self.protocol.wait_event(timeout)? {
            Some(frame) => Ok(route_events(vec![frame], self.registry)),
            None => Ok(Vec::new()),
        }
    }
}

fn open_viewer(url: &str, browser: Option<&str>) {
    if let Some(name) = browser {
        match name.parse::<webbrowser::Browser>() {
            Ok(choice) => match webbrowser::open_browser(choice, url) {
                Ok(()) => return,
                Err(err) => warn!("could not open {name}: {err}; using the default browser"),
            },
            Err(_) => warn!("unknown browser '{name}'; using the default browser"),
        }
    }
    if let Err(err) = webbrowser::open(url) {
        warn!("could not open a browser ({err}); open {url} manually");
    }
}
