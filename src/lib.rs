//! Drives a browser 3D viewer from a synchronous control loop.
//!
//! The control thread owns a [`Session`] and calls [`Session::step`] once per
//! tick. Network I/O runs on dedicated threads behind two [`MessageQueue`]s.

pub mod bootstrap;
pub mod config;
pub mod elements;
pub mod envelope;
pub mod error;
pub mod integrate;
pub mod port;
pub mod protocol;
pub mod queue;
pub mod render;
pub mod scene;
pub mod session;
pub mod transport;

pub use config::{BridgeConfig, TransportKind};
pub use elements::{ElementKind, ElementRegistry};
pub use envelope::{Envelope, NO_REPLY, UiEvent};
pub use error::{BridgeError, Result};
pub use integrate::{ControlMode, Joint, JointState, integrate};
pub use port::{Endpoint, PortBinder, ProtocolKind};
pub use protocol::RequestReply;
pub use queue::{MessageQueue, QueueError};
pub use scene::{Kinematics, Pose, SceneObject};
pub use session::Session;
