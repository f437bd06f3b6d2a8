// Timeouts, topics, motion tuning
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::imu::{AccelRange, GyroRange};

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Zenoh topics
pub const TOPIC_CMD: &str = "toybot/cmd/motion"; // command tokens
pub const TOPIC_ACK: &str = "toybot/ack/motion"; // per-token acknowledgement
pub const TOPIC_STATE: &str = "toybot/state/motion"; // runtime state

// Depth of the token queue between transport and motion loop
pub const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Everything tunable per robot hardware revision.
///
/// Any field missing from a config file falls back to its default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub imu: ImuConfig,
    pub drive: DriveConfig,
    pub motion: MotionConfig,
    pub dispatch: DispatchConfig,
    pub behavior: BehaviorConfig,
    pub sim: SimConfig,
}

impl RobotConfig {
    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Orientation sensor and estimator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImuConfig {
    /// 7-bit bus address of the sensor
    pub address: u8,
    pub gyro_range: GyroRange,
    pub accel_range: AccelRange,
    /// Complementary filter time constant in seconds
    pub filter_tau_s: f32,
    /// Samples averaged by a yaw calibration
    pub yaw_calibration_samples: usize,
    /// Samples averaged by a full six-axis calibration
    pub full_calibration_samples: usize,
    /// A yaw offset larger than this is rejected as a calibration anomaly
    pub max_gyro_bias_dps: f32,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            address: 0x68,
            gyro_range: GyroRange::Dps500,
            accel_range: AccelRange::G4,
            filter_tau_s: 0.5,
            yaw_calibration_samples: 2000,
            full_calibration_samples: 1000,
            max_gyro_bias_dps: 10.0,
        }
    }
}

/// Motor driver calibration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Left wheel gain, compensates for a faster left motor
    pub left_compensation: f32,
    pub right_compensation: f32,
    /// Duty written for a full-speed command (normalized 0.0-1.0)
    pub max_duty: f32,
    /// Pause after a timed hold before returning
    pub hold_settle_ms: u64,
    /// How long brake() holds all lines high
    pub brake_ms: u64,
    /// Extra pause stop() adds after braking
    pub stop_settle_ms: u64,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            left_compensation: 0.97,
            right_compensation: 1.00,
            max_duty: 1.0,
            hold_settle_ms: 50,
            brake_ms: 100,
            stop_settle_ms: 50,
        }
    }
}

impl DriveConfig {
    pub fn hold_settle(&self) -> Duration {
        Duration::from_millis(self.hold_settle_ms)
    }

    pub fn brake_duration(&self) -> Duration {
        Duration::from_millis(self.brake_ms)
    }

    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }
}

/// Closed-loop motion tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Wheel speed for a calibrated forward/backward step
    pub forward_speed: i16,
    /// Duration of one step in seconds
    pub step_duration_s: f32,
    /// Ramp-start speed is the target speed divided by this
    pub ramp_start_divisor: f32,
    /// Remaining-time fraction below which the ramp-down starts
    pub ramp_down_begin: f32,
    /// Remaining-time fraction over which speed ramps to zero
    pub ramp_down_window: f32,
    /// Wheel speed change per degree of heading error
    pub heading_adjust_rate: f32,
    /// Heading errors below this are left uncorrected
    pub heading_deadband_deg: f32,
    /// Heading errors above this are treated as sensor glitches
    pub heading_glitch_deg: f32,
    pub straight_tick_ms: u64,

    pub turn_speed_start: i16,
    /// Speed near the end of a turn; the final bands divide it further
    pub turn_speed_end: i16,
    /// Margin subtracted from every turn for coast/overshoot
    pub turn_angle_buffer_deg: f32,
    pub turn_timeout_ms: u64,
    pub turn_tick_ms: u64,
    /// Angle of a default left/right step turn
    pub default_turn_deg: f32,

    /// Pause around calibration and before/after stopping
    pub settle_ms: u64,
    /// Pause after calibration and after a turn brake
    pub turn_settle_ms: u64,
    /// Consecutive failed sensor reads a primitive tolerates
    pub max_sensor_failures: u32,

    /// Continuous forward/backward speed when no step count is given
    pub continuous_drive_speed: i16,
    /// Continuous spin speed when no turn angle is given
    pub continuous_spin_speed: i16,
    /// Manual (held button) drive speed
    pub manual_drive_speed: i16,
    /// Manual (held button) spin speed
    pub manual_turn_speed: i16,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            forward_speed: 90,
            step_duration_s: 1.47,
            ramp_start_divisor: 4.0,
            ramp_down_begin: 0.4,
            ramp_down_window: 0.3,
            heading_adjust_rate: 20.0,
            heading_deadband_deg: 0.2,
            heading_glitch_deg: 10.0,
            straight_tick_ms: 5,
            turn_speed_start: 90,
            turn_speed_end: 60,
            turn_angle_buffer_deg: 5.0,
            turn_timeout_ms: 6000,
            turn_tick_ms: 2,
            default_turn_deg: 92.0,
            settle_ms: 20,
            turn_settle_ms: 50,
            max_sensor_failures: 5,
            continuous_drive_speed: 80,
            continuous_spin_speed: 50,
            manual_drive_speed: 100,
            manual_turn_speed: 80,
        }
    }
}

impl MotionConfig {
    pub fn step_duration(&self) -> Duration {
        Duration::from_secs_f32(self.step_duration_s)
    }

    pub fn straight_tick(&self) -> Duration {
        Duration::from_millis(self.straight_tick_ms)
    }

    pub fn turn_tick(&self) -> Duration {
        Duration::from_millis(self.turn_tick_ms)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn turn_settle(&self) -> Duration {
        Duration::from_millis(self.turn_settle_ms)
    }
}

/// Command dispatch timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Pause between queued program steps
    pub program_step_pause_ms: u64,
    /// Pause after every manual control token
    pub control_settle_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            program_step_pause_ms: 1000,
            control_settle_ms: 10,
        }
    }
}

impl DispatchConfig {
    pub fn program_step_pause(&self) -> Duration {
        Duration::from_millis(self.program_step_pause_ms)
    }

    pub fn control_settle(&self) -> Duration {
        Duration::from_millis(self.control_settle_ms)
    }
}

/// Line following, obstacle avoidance and dance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Left reading below this means the sensor sees the line
    pub line_threshold_left: u16,
    pub line_threshold_right: u16,
    /// Obstacle reading below this means something is close
    pub obstacle_threshold: u16,
    pub line_tick_ms: u64,
    pub avoid_tick_ms: u64,
    /// Pause between stopping for a card and playing its track
    pub card_pause_ms: u64,
    pub dance_track: String,
    /// Emotion shown while a behavior runs
    pub default_emotion: String,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            line_threshold_left: 2000,
            line_threshold_right: 800,
            obstacle_threshold: 2000,
            line_tick_ms: 50,
            avoid_tick_ms: 10,
            card_pause_ms: 50,
            dance_track: "BABYSHARK.wav".to_string(),
            default_emotion: "NEUTRAL".to_string(),
        }
    }
}

impl BehaviorConfig {
    pub fn line_tick(&self) -> Duration {
        Duration::from_millis(self.line_tick_ms)
    }

    pub fn avoid_tick(&self) -> Duration {
        Duration::from_millis(self.avoid_tick_ms)
    }

    pub fn card_pause(&self) -> Duration {
        Duration::from_millis(self.card_pause_ms)
    }
}

/// Simulated robot used by the host runtime and the tests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Yaw rate in deg/s per unit of normalized left-minus-right duty
    pub yaw_gain_dps: f32,
    /// Constant gyro Z bias in deg/s
    pub gyro_bias_dps: f32,
    /// Length of every simulated audio track
    pub track_length_ms: u64,
    /// Wheels spin but the body never turns
    pub stalled: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            yaw_gain_dps: 100.0,
            gyro_bias_dps: 0.8,
            track_length_ms: 3000,
            stalled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "motion": { "forward_speed": 70 }, "drive": { "left_compensation": 0.9 } }"#;
        let config: RobotConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.motion.forward_speed, 70);
        assert_eq!(config.motion.turn_timeout_ms, 6000);
        assert_eq!(config.drive.left_compensation, 0.9);
        assert_eq!(config.drive.right_compensation, 1.0);
        assert_eq!(config.imu.gyro_range, GyroRange::Dps500);
    }

    #[test]
    fn test_ranges_deserialize_snake_case() {
        let json = r#"{ "imu": { "gyro_range": "dps2000", "accel_range": "g16" } }"#;
        let config: RobotConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.imu.gyro_range, GyroRange::Dps2000);
        assert_eq!(config.imu.accel_range, AccelRange::G16);
    }

    #[test]
    fn test_step_duration() {
        let config = MotionConfig::default();
        assert_eq!(config.step_duration(), Duration::from_secs_f32(1.47));
        assert_eq!(config.turn_timeout(), Duration::from_millis(6000));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RobotConfig::load("/nonexistent/toybot.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
