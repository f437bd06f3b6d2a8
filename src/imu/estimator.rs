// Orientation estimator
//
// Yaw (angle_z) is pure gyro integration. Tilt (angle_x, angle_y) blends the
// integrated gyro with the accelerometer's gravity direction through a
// complementary filter:
//
//   c     = tau / (tau + dt)
//   angle = angle * c + accel_angle * (1 - c)
//
// angle_z is never wrapped internally; use the normalized accessors.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::source::{Axis, ImuSource, OrientationSample, SensorError};
use crate::config::ImuConfig;

/// Sensor bias measured while the robot stands still
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CalibrationOffsets {
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
    pub accel_x: f32,
    pub accel_y: f32,
    pub accel_z: f32,
}

/// Result of one yaw calibration. min/max are for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YawCalibration {
    pub offset: f32,
    pub min: f32,
    pub max: f32,
    pub samples: usize,
}

impl YawCalibration {
    pub fn spread(&self) -> f32 {
        self.max - self.min
    }
}

/// Integrated angles in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationState {
    pub angle_x: f32,
    pub angle_y: f32,
    pub angle_z: f32,
    pub last_update: Instant,
}

impl OrientationState {
    fn zeroed(now: Instant) -> Self {
        Self {
            angle_x: 0.0,
            angle_y: 0.0,
            angle_z: 0.0,
            last_update: now,
        }
    }

    /// Yaw folded into (-180, 180]
    pub fn normalized_signed(&self) -> f32 {
        wrap_signed(self.angle_z)
    }

    /// Yaw folded into [0, 360)
    pub fn normalized_unsigned(&self) -> f32 {
        wrap_unsigned(self.angle_z)
    }
}

/// Fold an angle into (-180, 180], keeping its sign where possible
pub fn wrap_signed(deg: f32) -> f32 {
    let folded = deg % 360.0;
    if folded > 180.0 {
        folded - 360.0
    } else if folded <= -180.0 {
        folded + 360.0
    } else {
        folded
    }
}

/// Fold an angle into [0, 360)
pub fn wrap_unsigned(deg: f32) -> f32 {
    let folded = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if folded >= 360.0 { 0.0 } else { folded }
}

/// Tilt angles (x, y) in degrees implied by the gravity vector
fn accel_tilt(sample: &OrientationSample) -> (f32, f32) {
    let (ax, ay, az) = (sample.accel_x, sample.accel_y, sample.accel_z);
    let x = ax.atan2((ay * ay + az * az).sqrt()).to_degrees();
    let y = ay.atan2((ax * ax + az * az).sqrt()).to_degrees();
    (x, y)
}

/// Continuously updated heading/tilt estimate over an owned sensor
pub struct OrientationEstimator<S: ImuSource> {
    sensor: S,
    tau: f32,
    max_gyro_bias: f32,
    yaw_samples: usize,
    full_samples: usize,
    offsets: CalibrationOffsets,
    state: OrientationState,
    last_yaw_calibration: Option<YawCalibration>,
}

impl<S: ImuSource> OrientationEstimator<S> {
    pub fn new(sensor: S, config: &ImuConfig) -> Self {
        Self {
            sensor,
            tau: config.filter_tau_s,
            max_gyro_bias: config.max_gyro_bias_dps,
            yaw_samples: config.yaw_calibration_samples,
            full_samples: config.full_calibration_samples,
            offsets: CalibrationOffsets::default(),
            state: OrientationState::zeroed(Instant::now()),
            last_yaw_calibration: None,
        }
    }

    /// Measure the yaw-rate bias. Blocks for `sample_count` reads.
    ///
    /// Gyro bias drifts, so call this right before every yaw-dependent
    /// primitive. An offset beyond the configured bound is rejected and the
    /// previous offset is kept.
    pub fn calibrate_yaw(&mut self, sample_count: usize) -> Result<YawCalibration, SensorError> {
        if sample_count == 0 {
            return Err(SensorError::NoSamples);
        }

        let first = self.sensor.read_yaw_rate()?;
        let (mut min, mut max, mut sum) = (first, first, first);
        for _ in 1..sample_count {
            let rate = self.sensor.read_yaw_rate()?;
            min = min.min(rate);
            max = max.max(rate);
            sum += rate;
        }

        let calibration = YawCalibration {
            offset: sum / sample_count as f32,
            min,
            max,
            samples: sample_count,
        };
        debug!(
            "Yaw calibration: offset={:.4} min={:.4} max={:.4}",
            calibration.offset, calibration.min, calibration.max
        );

        if calibration.offset.abs() > self.max_gyro_bias {
            warn!(
                "Yaw offset {:.3} deg/s out of bounds, keeping {:.3}",
                calibration.offset, self.offsets.gyro_z
            );
            return Err(SensorError::CalibrationAnomaly {
                offset: calibration.offset,
                limit: self.max_gyro_bias,
            });
        }

        self.offsets.gyro_z = calibration.offset;
        self.last_yaw_calibration = Some(calibration);
        Ok(calibration)
    }

    /// Six-axis averaging calibration (robot flat and still)
    pub fn calibrate(
        &mut self,
        sample_count: usize,
        delay: Duration,
    ) -> Result<CalibrationOffsets, SensorError> {
        let mean = self.sensor.read_averaged(sample_count, delay)?;
        if mean.gyro_z.abs() > self.max_gyro_bias {
            return Err(SensorError::CalibrationAnomaly {
                offset: mean.gyro_z,
                limit: self.max_gyro_bias,
            });
        }

        self.offsets = CalibrationOffsets {
            gyro_x: mean.gyro_x,
            gyro_y: mean.gyro_y,
            gyro_z: mean.gyro_z,
            accel_x: mean.accel_x,
            accel_y: mean.accel_y,
            accel_z: mean.accel_z,
        };
        info!("IMU calibrated: {:?}", self.offsets);
        Ok(self.offsets)
    }

    /// Startup calibration with the configured sample count
    pub fn calibrate_full(&mut self) -> Result<CalibrationOffsets, SensorError> {
        self.calibrate(self.full_samples, Duration::ZERO)
    }

    /// Zero all angles and restart the integration clock
    pub fn reset_integration(&mut self) {
        self.reset_integration_at(Instant::now());
    }

    pub fn reset_integration_at(&mut self, now: Instant) {
        self.state = OrientationState::zeroed(now);
    }

    /// Integrate one yaw-rate reading. Returns the raw (unwrapped) yaw.
    ///
    /// On a failed read neither the angle nor the clock move, so the next
    /// successful read covers the whole gap.
    pub fn update_yaw(&mut self) -> Result<f32, SensorError> {
        let rate = self.sensor.read_yaw_rate()?;
        self.integrate_yaw_rate(rate, Instant::now());
        Ok(self.state.angle_z)
    }

    pub fn integrate_yaw_rate(&mut self, rate: f32, now: Instant) {
        let dt = self.step_clock(now);
        self.state.angle_z += (rate - self.offsets.gyro_z) * dt;
    }

    /// Full three-axis update from one (unaveraged) sample
    pub fn update(&mut self) -> Result<OrientationState, SensorError> {
        let sample = self.sensor.read_sample()?;
        self.apply_sample(&sample, Instant::now());
        Ok(self.state)
    }

    pub fn apply_sample(&mut self, sample: &OrientationSample, now: Instant) {
        let gx = sample.gyro_x - self.offsets.gyro_x;
        let gy = sample.gyro_y - self.offsets.gyro_y;
        let gz = sample.gyro_z - self.offsets.gyro_z;
        let (tilt_x, tilt_y) = accel_tilt(sample);

        let dt = self.step_clock(now);

        // Sensor is mounted with a fixed orientation; flipping the board over
        // flips the sense of the X/Y rotations.
        if sample.accel_z > 0.0 {
            self.state.angle_x -= gy * dt;
            self.state.angle_y += gx * dt;
        } else {
            self.state.angle_x += gy * dt;
            self.state.angle_y -= gx * dt;
        }
        self.state.angle_z += gz * dt;

        let c = self.tau / (self.tau + dt);
        self.state.angle_x = self.state.angle_x * c + tilt_x * (1.0 - c);
        self.state.angle_y = self.state.angle_y * c + tilt_y * (1.0 - c);
    }

    fn step_clock(&mut self, now: Instant) -> f32 {
        let dt = now.saturating_duration_since(self.state.last_update).as_secs_f32();
        self.state.last_update = now;
        dt
    }

    /// Offset-corrected gyro rates averaged over `n_samples`
    pub fn gyro_rates(&mut self, n_samples: usize) -> Result<(f32, f32, f32), SensorError> {
        let mean = self.sensor.read_averaged(n_samples, Duration::ZERO)?;
        Ok((
            mean.gyro_x - self.offsets.gyro_x,
            mean.gyro_y - self.offsets.gyro_y,
            mean.gyro_z - self.offsets.gyro_z,
        ))
    }

    /// Acceleration on one axis as a percentage of 1 g, clamped to ±100.
    /// Z is reported relative to gravity so a level robot reads 0.
    pub fn accel_percent(&mut self, axis: Axis, n_samples: usize) -> Result<i16, SensorError> {
        let g = self.sensor.read_axis_averaged(axis, n_samples, Duration::ZERO)?;
        let percent = match axis {
            Axis::AccelZ => g * 100.0 - 100.0,
            _ => g * 100.0,
        };
        Ok(percent.round().clamp(-100.0, 100.0) as i16)
    }

    pub fn state(&self) -> OrientationState {
        self.state
    }

    pub fn angle_x(&self) -> f32 {
        self.state.angle_x
    }

    pub fn angle_y(&self) -> f32 {
        self.state.angle_y
    }

    pub fn angle_z(&self) -> f32 {
        self.state.angle_z
    }

    pub fn normalized_signed(&self) -> f32 {
        self.state.normalized_signed()
    }

    pub fn normalized_unsigned(&self) -> f32 {
        self.state.normalized_unsigned()
    }

    pub fn offsets(&self) -> CalibrationOffsets {
        self.offsets
    }

    /// Sample count configured for yaw calibration
    pub fn yaw_samples(&self) -> usize {
        self.yaw_samples
    }

    pub fn last_yaw_calibration(&self) -> Option<YawCalibration> {
        self.last_yaw_calibration
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }
}
