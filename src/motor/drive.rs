// Differential drive over two H-bridges
//
// Each wheel has a forward and a reverse line:
//
// | fwd | rev | wheel                 |
// |-----|-----|-----------------------|
// | 0   | 0   | coast                 |
// | PWM | 0   | forward               |
// | 0   | PWM | reverse               |
// | max | max | brake (short circuit) |

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::DriveConfig;

/// Error types for the actuator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActuatorError {
    #[error("PWM output fault: {0}")]
    Pwm(String),
}

/// A single PWM-capable output line
pub trait PwmOutput {
    /// Set the duty cycle as a fraction in [0.0, 1.0]
    fn set_duty(&mut self, duty: f32) -> Result<(), ActuatorError>;
}

/// Normalized wheel speeds in [-100, 100]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WheelCommand {
    pub left: i16,
    pub right: i16,
}

impl WheelCommand {
    /// Build a command, clamping both speeds into [-100, 100]
    pub fn new(left: i16, right: i16) -> Self {
        Self {
            left: left.clamp(-100, 100),
            right: right.clamp(-100, 100),
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    /// Both wheels at the same speed
    pub fn straight(speed: i16) -> Self {
        Self::new(speed, speed)
    }

    /// Wheels in opposite directions (left gets `speed`)
    pub fn spin(speed: i16) -> Self {
        Self::new(speed, -speed)
    }

    pub fn is_zero(&self) -> bool {
        self.left == 0 && self.right == 0
    }
}

/// What the four lines are currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    Coasting,
    Driving,
    Braking,
}

/// (forward, reverse) duty for one wheel
///
/// Speed is clamped to [-100, 100] before and after compensation so the
/// duty never leaves [0, max_duty].
pub fn wheel_duty(speed: i16, compensation: f32, max_duty: f32) -> (f32, f32) {
    let compensated = (speed.clamp(-100, 100) as f32 * compensation).clamp(-100.0, 100.0);
    let duty = compensated.abs() / 100.0 * max_duty;
    if compensated > 0.0 {
        (duty, 0.0)
    } else if compensated < 0.0 {
        (0.0, duty)
    } else {
        (0.0, 0.0)
    }
}

/// Motor driver owning the four H-bridge lines
pub struct DifferentialDrive<P: PwmOutput> {
    left_fwd: P,
    left_rev: P,
    right_fwd: P,
    right_rev: P,
    config: DriveConfig,
    duties: [f32; 4],
    state: DriveState,
    last_command: WheelCommand,
}

impl<P: PwmOutput> DifferentialDrive<P> {
    /// Take ownership of the lines and force them to coast
    pub fn new(
        left_fwd: P,
        left_rev: P,
        right_fwd: P,
        right_rev: P,
        config: DriveConfig,
    ) -> Result<Self, ActuatorError> {
        let mut drive = Self {
            left_fwd,
            left_rev,
            right_fwd,
            right_rev,
            config,
            duties: [0.0; 4],
            state: DriveState::Coasting,
            last_command: WheelCommand::zero(),
        };
        drive.coast()?;
        Ok(drive)
    }

    fn write_lines(&mut self, duties: [f32; 4]) -> Result<(), ActuatorError> {
        self.left_fwd.set_duty(duties[0])?;
        self.left_rev.set_duty(duties[1])?;
        self.right_fwd.set_duty(duties[2])?;
        self.right_rev.set_duty(duties[3])?;
        self.duties = duties;
        Ok(())
    }

    /// Drive both wheels now, without waiting
    pub fn apply(&mut self, cmd: WheelCommand) -> Result<(), ActuatorError> {
        let (lf, lr) = wheel_duty(cmd.left, self.config.left_compensation, self.config.max_duty);
        let (rf, rr) = wheel_duty(cmd.right, self.config.right_compensation, self.config.max_duty);

        debug!("Wheels: left={} right={}", cmd.left, cmd.right);
        self.write_lines([lf, lr, rf, rr])?;
        self.last_command = cmd;
        self.state = if cmd.is_zero() {
            DriveState::Coasting
        } else {
            DriveState::Driving
        };
        Ok(())
    }

    /// Drive both wheels; with `hold`, keep the speeds for that long, then
    /// coast and let the motor current settle before returning.
    pub async fn set_wheel_speeds(
        &mut self,
        cmd: WheelCommand,
        hold: Option<Duration>,
    ) -> Result<(), ActuatorError> {
        self.apply(cmd)?;
        if let Some(hold) = hold {
            tokio::time::sleep(hold).await;
            self.coast()?;
            tokio::time::sleep(self.config.hold_settle()).await;
        }
        Ok(())
    }

    /// All lines to zero; wheels freewheel
    pub fn coast(&mut self) -> Result<(), ActuatorError> {
        self.write_lines([0.0; 4])?;
        self.last_command = WheelCommand::zero();
        self.state = DriveState::Coasting;
        Ok(())
    }

    /// All lines to max duty, without waiting
    pub fn brake_lines(&mut self) -> Result<(), ActuatorError> {
        let max = self.config.max_duty;
        self.write_lines([max; 4])?;
        self.last_command = WheelCommand::zero();
        self.state = DriveState::Braking;
        Ok(())
    }

    /// Dynamic braking for the configured brake time
    pub async fn brake(&mut self) -> Result<(), ActuatorError> {
        self.brake_lines()?;
        tokio::time::sleep(self.config.brake_duration()).await;
        Ok(())
    }

    /// Brake, then pause
    pub async fn stop(&mut self) -> Result<(), ActuatorError> {
        self.brake().await?;
        tokio::time::sleep(self.config.stop_settle()).await;
        Ok(())
    }

    /// Last written duties: [left fwd, left rev, right fwd, right rev]
    pub fn duties(&self) -> [f32; 4] {
        self.duties
    }

    pub fn state(&self) -> DriveState {
        self.state
    }

    pub fn last_command(&self) -> WheelCommand {
        self.last_command
    }

    pub fn config(&self) -> &DriveConfig {
        &self.config
    }
}

impl<P: PwmOutput> Drop for DifferentialDrive<P> {
    fn drop(&mut self) {
        if let Err(e) = self.coast() {
            warn!("Failed to coast motors on drop: {}", e);
        }
    }
}
