//! Objects managed by a session and the pose batches sent for them.

use std::fmt;

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::Result;
use crate::integrate::{ControlMode, JointState, integrate};

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Pose {
    pub position: [f64; 3],
    /// Quaternion, scalar first.
    pub rotation: [f64; 4],
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        position: [0.0; 3],
        rotation: [1.0, 0.0, 0.0, 0.0],
    };

    pub fn at(position: [f64; 3]) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }
}

/// Forward kinematics for an articulated object: one pose per rendered link.
pub trait Kinematics: Send {
    fn link_poses(&self, positions: &[f64]) -> Vec<Pose>;
}

pub enum SceneObject {
    Articulated {
        joints: JointState,
        control: ControlMode,
        kinematics: Box<dyn Kinematics>,
    },
    Rigid {
        pose: Pose,
    },
}

impl SceneObject {
    /// Builds an articulated object from a control mode name such as `"v"`.
    pub fn articulated(
        joints: JointState,
        control: &str,
        kinematics: impl Kinematics + 'static,
    ) -> Result<Self> {
        Ok(Self::Articulated {
            joints,
            control: control.parse()?,
            kinematics: Box::new(kinematics),
        })
    }

    pub fn integrate(&mut self, dt: f64) -> Result<()> {
        match self {
            Self::Articulated {
                joints, control, ..
            } => integrate(joints, *control, dt),
            Self::Rigid { .. } => Ok(()),
        }
    }

    pub fn poses(&self) -> Vec<Pose> {
        match self {
            Self::Articulated {
                joints, kinematics, ..
            } => kinematics.link_poses(&joints.positions()),
            Self::Rigid { pose } => vec![*pose],
        }
    }

    pub fn joints_mut(&mut self) -> Option<&mut JointState> {
        match self {
            Self::Articulated { joints, .. } => Some(joints),
            Self::Rigid { .. } => None,
        }
    }
}

impl fmt::Debug for SceneObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Articulated {
                joints, control, ..
            } => f
                .debug_struct("Articulated")
                .field("joints", joints)
                .field("control", control)
                .finish_non_exhaustive(),
            Self::Rigid { pose } => f.debug_struct("Rigid").field("pose", pose).finish(),
        }
    }
}

/// A scene object plus the id the viewer assigned to it.
#[derive(Debug)]
pub struct ManagedObject {
    pub id: String,
    pub descriptor: Value,
    pub object: SceneObject,
}

/// Payload of the `shape_poses` command.
pub fn pose_batch(objects: &[ManagedObject], frames: u32) -> Value {
    let entries: Vec<Value> = objects
        .iter()
        .map(|managed| json!([managed.id, managed.object.poses()]))
        .collect();
    json!({ "frames": frames, "objects": entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::integrate::Joint;

    /// Links stacked along z, each raised by its joint position.
    struct Stack;

    impl Kinematics for Stack {
        fn link_poses(&self, positions: &[f64]) -> Vec<Pose> {
            let mut height = 0.0;
            positions
                .iter()
                .map(|position| {
                    height += 1.0 + position;
                    Pose::at([0.0, 0.0, height])
                })
                .collect()
        }
    }

    #[test]
    fn articulated_objects_integrate_and_pose() {
        let joints = JointState::new(vec![Joint::free(0.0, 1.0), Joint::limited(0.0, 1.0, 0.0, 0.5)]);
        let mut object = SceneObject::articulated(joints, "v", Stack).unwrap();
        object.integrate(1.0).unwrap();
        let poses = object.poses();
        assert_eq!(poses[0].position, [0.0, 0.0, 2.0]);
        assert_eq!(poses[1].position, [0.0, 0.0, 3.5]);
    }

    #[test]
    fn unknown_control_mode_fails_at_registration() {
        let result = SceneObject::articulated(JointState::default(), "q", Stack);
        assert!(matches!(result, Err(BridgeError::InvalidControlMode(_))));
    }

    #[test]
    fn batch_lists_every_object() {
        let objects = vec![
            ManagedObject {
                id: "4".into(),
                descriptor: json!({"stype": "box"}),
                object: SceneObject::Rigid {
                    pose: Pose::at([1.0, 2.0, 3.0]),
                },
            },
            ManagedObject {
                id: "5".into(),
                descriptor: json!({}),
                object: SceneObject::articulated(
                    JointState::new(vec![Joint::free(0.0, 0.0)]),
                    "p",
                    Stack,
                )
                .unwrap(),
            },
        ];
        let batch = pose_batch(&objects, 3);
        assert_eq!(batch["frames"], json!(3));
        assert_eq!(
            batch["objects"][0],
            json!(["4", [{"position": [1.0, 2.0, 3.0], "rotation": [1.0, 0.0, 0.0, 0.0]}]])
        );
        assert_eq!(batch["objects"][1][1][0]["position"], json!([0.0, 0.0, 1.0]));
    }
}
