// Motor control for the two-wheel robot body
//
// Provides:
// - The PWM output seam
// - Wheel-speed to H-bridge duty mapping with per-wheel compensation
// - Coast / brake / timed-hold primitives

mod drive;

pub use drive::{wheel_duty, ActuatorError, DifferentialDrive, DriveState, PwmOutput, WheelCommand};
