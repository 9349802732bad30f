use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use rand::Rng;
use scenelink::{
    BridgeConfig, BridgeError, ElementKind, Envelope, Joint, JointState, Kinematics, Pose,
    SceneObject, Session,
};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message as TMessage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEMO_JOINTS: usize = 4;
const DEMO_DT: f64 = 1.0 / 240.0;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok()))
        .with_target(false)
        .compact()
        .init();

    let args: Vec<String> = std::env::args().collect();
    if let Some(url) = parse_viewer_arg(&args) {
        run_headless_viewer(url).await;
        return;
    }

    let config = BridgeConfig::from_env();
    match tokio::task::spawn_blocking(move || run_demo(config)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("demo session ended: {err}"),
        Err(err) => error!("demo session panicked: {err}"),
    }
}

/// `RUST_LOG` directives when they parse, `info` otherwise.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

fn parse_viewer_arg(args: &[String]) -> Option<String> {
    args.iter()
        .position(|arg| arg == "--viewer")
        .and_then(|index| args.get(index + 1))
        .cloned()
}

/// Planar chain of unit links rotating about z.
struct PlanarChain;

impl Kinematics for PlanarChain {
    fn link_poses(&self, positions: &[f64]) -> Vec<Pose> {
        let mut angle = 0.0_f64;
        let mut origin = [0.0_f64; 3];
        positions
            .iter()
            .map(|position| {
                angle += position;
                let pose = Pose {
                    position: origin,
                    rotation: [(angle / 2.0).cos(), 0.0, 0.0, (angle / 2.0).sin()],
                };
                origin[0] += angle.cos();
                origin[1] += angle.sin();
                pose
            })
            .collect()
    }
}

fn run_demo(config: BridgeConfig) -> scenelink::Result<()> {
    let mut session = Session::launch(config)?;
    let mut rng = rand::rng();
    let joints = (0..DEMO_JOINTS)
        .map(|_| Joint::limited(0.0, rng.random_range(-1.0..1.0), -1.5, 1.5))
        .collect();
    let arm = session.add(
        json!({"stype": "chain", "links": DEMO_JOINTS}),
        SceneObject::articulated(JointState::new(joints), "v", PlanarChain)?,
    )?;

    let speed = Arc::new(Mutex::new(1.0_f64));
    let speed_sink = speed.clone();
    session.add_element(
        ElementKind::slider("speed", 0.0, 3.0, 0.1, 1.0),
        Some(Box::new(move |kind: &ElementKind, _: &Value| {
            if let ElementKind::Slider { value, .. } = kind {
                *speed_sink.lock().expect("speed mutex poisoned") = *value;
            }
        })),
    )?;
    let clock = session.add_element(ElementKind::label("t = 0.00 s"), None)?;

    let mut tick: u64 = 0;
    loop {
        let scale = *speed.lock().expect("speed mutex poisoned");
        if let Some(joints) = session.object_mut(&arm).and_then(SceneObject::joints_mut) {
            for joint in &mut joints.joints {
                let at_limit = joint.position <= joint.lower || joint.position >= joint.upper;
                if at_limit && joint.velocity * joint.position > 0.0 {
                    joint.velocity = -joint.velocity;
                }
            }
        }
        match session.step(DEMO_DT * scale) {
            Ok(()) => {}
            Err(BridgeError::PeerDisconnected) => {
                info!("viewer disconnected; stopping demo");
                break;
            }
            Err(err) => return Err(err),
        }
        tick += 1;
        if tick % 240 == 0 {
            let label = format!("t = {:.2} s", session.sim_time());
            session.update_element(&clock, |kind| *kind = ElementKind::label(label));
        }
    }
    session.close()
}

/// A stand-in for the browser viewer: identifies itself and answers every
/// expect-reply envelope until told to close.
async fn run_headless_viewer(url: String) {
    info!("starting headless viewer: {url}");
    let ws_stream = match tokio_tungstenite::connect_async(&url).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(err) => {
            error!("failed to connect to {url}: {err}");
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    if ws_tx.send(TMessage::Text("Connected".into())).await.is_err() {
        return;
    }

    let mut next_shape: u64 = 0;
    let mut frames: u64 = 0;
    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(TMessage::Text(text)) => text.to_string(),
            Ok(TMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!("headless viewer receive error: {err}");
                break;
            }
        };
        let envelope = match Envelope::from_wire(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("headless viewer ignoring malformed envelope: {err}");
                continue;
            }
        };
        if envelope.command == "close" {
            info!("bridge closed the session after {frames} pose pushes");
            break;
        }
        if !envelope.expect_reply {
            continue;
        }
        let reply = match envelope.command.as_str() {
            "shape" => {
                next_shape += 1;
                (next_shape - 1).to_string()
            }
            "shape_mounted" => "1".to_string(),
            "shape_poses" => {
                frames += 1;
                "{}".to_string()
            }
            "check_elements" => "{}".to_string(),
            _ => scenelink::NO_REPLY.to_string(),
        };
        if ws_tx.send(TMessage::Text(reply.into())).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn log_filter_prefers_rust_log() {
        assert_eq!(
            log_filter(Some("debug".into())).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
        assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(
            log_filter(Some("scenelink=loud".into())).max_level_hint(),
            Some(LevelFilter::INFO)
        );
    }

    #[test]
    fn viewer_arg_takes_the_following_url() {
        let args = ["scenelink", "--viewer", "ws://127.0.0.1:53000/"].map(String::from);
        assert_eq!(
            parse_viewer_arg(&args).as_deref(),
            Some("ws://127.0.0.1:53000/")
        );
        assert_eq!(parse_viewer_arg(&args[..2]), None);
    }
}
