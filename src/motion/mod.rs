// Closed-loop motion primitives
mod abort;
mod controller;
pub mod schedule;

use std::time::Duration;

pub use abort::{abort_pair, AbortHandle, AbortSignal};
pub use controller::{MotionController, TurnSession};

use crate::config::MotionConfig;
use crate::imu::SensorError;
use crate::motor::{ActuatorError, WheelCommand};

/// Error types for motion primitives
#[derive(Debug, thiserror::Error)]
pub enum MotionError {
    #[error("Turn timed out after {elapsed_ms} ms: reached {reached_deg:.1} of {target_deg:.1} deg")]
    Timeout {
        target_deg: f32,
        reached_deg: f32,
        elapsed_ms: u64,
    },

    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("Motion aborted")]
    Aborted,
}

/// Direction of a manual (held button) drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
    Left,
    Right,
}

/// Anything the dispatcher can ask the robot to do
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionRequest {
    /// `None` drives forward until the next command
    Forward { steps: Option<u32> },
    Backward { steps: Option<u32> },
    /// `None` spins until the next command
    TurnLeft { angle: Option<f32> },
    TurnRight { angle: Option<f32> },
    ManualDrive(Direction),
    Stop,
}

/// Outcome of a completed primitive
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionReport {
    /// Yaw at the end of the primitive, folded into (-180, 180]
    pub final_yaw: f32,
    pub elapsed: Duration,
    pub ticks: u32,
    /// Ticks where no heading correction was applied (glitch or failed read)
    pub skipped_corrections: u32,
}

/// The primitives a motion backend has to provide
///
/// `execute` maps every `MotionRequest` onto them, so the dispatcher and the
/// behaviours only ever talk to this trait.
#[allow(async_fn_in_trait)]
pub trait MotionPrimitives {
    async fn drive_straight(&mut self, speed: i16, duration: Duration) -> Result<MotionReport, MotionError>;

    /// Positive angles turn right, negative left
    async fn turn_by_angle(&mut self, angle: f32) -> Result<MotionReport, MotionError>;

    async fn set_wheels(&mut self, cmd: WheelCommand) -> Result<(), MotionError>;

    /// Brake, pause, then let the wheels coast
    async fn stop(&mut self) -> Result<(), MotionError>;

    fn motion_config(&self) -> &MotionConfig;

    fn abort_signal(&self) -> AbortSignal;

    async fn execute(&mut self, request: MotionRequest) -> Result<MotionReport, MotionError> {
        let config = self.motion_config().clone();
        match request {
            MotionRequest::Forward { steps: Some(steps) } => {
                self.drive_straight(config.forward_speed, config.step_duration() * steps)
                    .await
            }
            MotionRequest::Backward { steps: Some(steps) } => {
                self.drive_straight(-config.forward_speed, config.step_duration() * steps)
                    .await
            }
            MotionRequest::Forward { steps: None } => {
                self.set_wheels(WheelCommand::straight(config.continuous_drive_speed))
                    .await?;
                Ok(MotionReport::default())
            }
            MotionRequest::Backward { steps: None } => {
                self.set_wheels(WheelCommand::straight(-config.continuous_drive_speed))
                    .await?;
                Ok(MotionReport::default())
            }
            MotionRequest::TurnLeft { angle } => match angle {
                Some(angle) => self.turn_by_angle(-angle.abs()).await,
                None => {
                    self.set_wheels(WheelCommand::spin(config.continuous_spin_speed))
                        .await?;
                    Ok(MotionReport::default())
                }
            },
            MotionRequest::TurnRight { angle } => match angle {
                Some(angle) => self.turn_by_angle(angle.abs()).await,
                None => {
                    self.set_wheels(WheelCommand::spin(-config.continuous_spin_speed))
                        .await?;
                    Ok(MotionReport::default())
                }
            },
            MotionRequest::ManualDrive(direction) => {
                let cmd = match direction {
                    Direction::Forward => WheelCommand::straight(config.manual_drive_speed),
                    Direction::Backward => WheelCommand::straight(-config.manual_drive_speed),
                    Direction::Left => WheelCommand::spin(config.manual_turn_speed),
                    Direction::Right => WheelCommand::spin(-config.manual_turn_speed),
                };
                self.set_wheels(cmd).await?;
                Ok(MotionReport::default())
            }
            MotionRequest::Stop => {
                self.stop().await?;
                Ok(MotionReport::default())
            }
        }
    }
}
