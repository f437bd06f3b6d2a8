// Speed schedules for the closed loops
//
// Pure functions so the ramps and bands can be checked without hardware.

use crate::config::MotionConfig;
use crate::motor::WheelCommand;

/// First speed of a straight drive, before the loop takes over
pub fn ramp_start(speed: i16, config: &MotionConfig) -> i16 {
    (speed as f32 / config.ramp_start_divisor).trunc() as i16
}

/// Target speed for the given fraction of drive time still remaining.
///
/// Full speed until `ramp_down_begin`, then scaled down linearly over
/// `ramp_down_window`. The scale never exceeds 1.
pub fn ramp_speed(speed: i16, remaining: f32, config: &MotionConfig) -> i16 {
    if remaining < config.ramp_down_begin {
        let factor = (remaining / config.ramp_down_window).clamp(0.0, 1.0);
        (speed as f32 * factor).trunc() as i16
    } else {
        speed
    }
}

/// Wheel command that steers a straight drive back to zero yaw.
///
/// `None` means the reading looks like a glitch and the previous command
/// should stay in place.
pub fn heading_correction(speed: i16, yaw: f32, config: &MotionConfig) -> Option<WheelCommand> {
    let error = yaw.abs();
    if error > config.heading_glitch_deg {
        return None;
    }
    if error <= config.heading_deadband_deg {
        return Some(WheelCommand::straight(speed));
    }

    let adjust = yaw * config.heading_adjust_rate;
    let wheel = |value: f32| value.round().clamp(-100.0, 100.0) as i16;
    Some(WheelCommand::new(
        wheel(speed as f32 - adjust),
        wheel(speed as f32 + adjust),
    ))
}

/// (target distance, speed factor) of a turn
///
/// Positive angles turn with factor 1, everything else with -1. The buffer
/// leaves room for the coast after braking.
pub fn turn_target(angle: f32, buffer: f32, accumulated_error: f32) -> (f32, i16) {
    if angle > 0.0 {
        (angle.abs() - buffer - accumulated_error, 1)
    } else {
        (angle.abs() - buffer + accumulated_error, -1)
    }
}

/// Wheel command for a turn that has covered `distance` of `target` degrees
pub fn turn_band_command(distance: f32, target: f32, factor: i16, config: &MotionConfig) -> WheelCommand {
    let end = config.turn_speed_end;
    let (left, right) = if distance >= target - 1.0 {
        (end / 2, end / 3)
    } else if distance >= target - 10.0 {
        let slow = (end as f32 / 1.5).floor() as i16;
        (slow, slow)
    } else if distance >= target - 20.0 {
        (end, end)
    } else {
        (config.turn_speed_start, config.turn_speed_start)
    };
    WheelCommand::new(-factor * left, factor * right)
}
