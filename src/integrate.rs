use std::str::FromStr;

use crate::error::{BridgeError, Result};

/// How a managed object's joints are driven.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMode {
    Position,
    Velocity,
    Acceleration,
}

impl FromStr for ControlMode {
    type Err = BridgeError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "p" | "position" => Ok(Self::Position),
            "v" | "velocity" => Ok(Self::Velocity),
            "a" | "acceleration" => Ok(Self::Acceleration),
            other => Err(BridgeError::InvalidControlMode(other.to_string())),
        }
    }
}

impl TryFrom<char> for ControlMode {
    type Error = BridgeError;

    fn try_from(raw: char) -> Result<Self> {
        raw.to_string().parse()
    }
}

/// One degree of freedom.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Joint {
    pub position: f64,
    pub velocity: f64,
    pub lower: f64,
    pub upper: f64,
    pub limit_valid: bool,
}

impl Joint {
    pub fn free(position: f64, velocity: f64) -> Self {
        Self {
            position,
            velocity,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
            limit_valid: false,
        }
    }

    pub fn limited(position: f64, velocity: f64, lower: f64, upper: f64) -> Self {
        Self {
            position,
            velocity,
            lower,
            upper,
            limit_valid: true,
        }
    }

    fn limits_usable(&self) -> bool {
        self.limit_valid && !self.lower.is_nan() && !self.upper.is_nan() && self.lower < self.upper
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct JointState {
    pub joints: Vec<Joint>,
}

impl JointState {
    pub fn new(joints: Vec<Joint>) -> Self {
        Self { joints }
    }

    pub fn positions(&self) -> Vec<f64> {
        self.joints.iter().map(|joint| joint.position).collect()
    }
}

/// Advances velocity-controlled joints by `q += qd * dt`, clamping to the
/// joint limits when they are marked valid. Position and acceleration
/// control are applied elsewhere and leave the state untouched here.
pub fn integrate(state: &mut JointState, mode: ControlMode, dt: f64) -> Result<()> {
    match mode {
        ControlMode::Position | ControlMode::Acceleration => Ok(()),
        ControlMode::Velocity => {
            for joint in &mut state.joints {
                joint.position += joint.velocity * dt;
                if joint.limits_usable() {
                    if joint.position < joint.lower {
                        joint.position = joint.lower;
                    } else if joint.position > joint.upper {
                        joint.position = joint.upper;
                    }
                }
            }
            Ok(())
        }
    }
}
