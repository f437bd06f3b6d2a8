// Scaled inertial samples and the sensor seam the estimator reads from

use std::time::Duration;

use super::bus::BusError;

/// One accelerometer + gyroscope snapshot in physical units (g, deg/s)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OrientationSample {
    pub accel_x: f32,
    pub accel_y: f32,
    pub accel_z: f32,
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
}

impl OrientationSample {
    /// A sample from a sensor lying flat and still
    pub fn level() -> Self {
        Self {
            accel_z: 1.0,
            ..Default::default()
        }
    }

    pub fn axis(&self, axis: Axis) -> f32 {
        match axis {
            Axis::AccelX => self.accel_x,
            Axis::AccelY => self.accel_y,
            Axis::AccelZ => self.accel_z,
            Axis::GyroX => self.gyro_x,
            Axis::GyroY => self.gyro_y,
            Axis::GyroZ => self.gyro_z,
        }
    }

    fn scaled(&self, factor: f32) -> Self {
        Self {
            accel_x: self.accel_x * factor,
            accel_y: self.accel_y * factor,
            accel_z: self.accel_z * factor,
            gyro_x: self.gyro_x * factor,
            gyro_y: self.gyro_y * factor,
            gyro_z: self.gyro_z * factor,
        }
    }

    fn add(&mut self, other: &Self) {
        self.accel_x += other.accel_x;
        self.accel_y += other.accel_y;
        self.accel_z += other.accel_z;
        self.gyro_x += other.gyro_x;
        self.gyro_y += other.gyro_y;
        self.gyro_z += other.gyro_z;
    }
}

/// Individual sensor channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    AccelX,
    AccelY,
    AccelZ,
    GyroX,
    GyroY,
    GyroZ,
}

/// Error types for orientation sensing
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("Bus error at register 0x{register:02X}: {source}")]
    Bus {
        register: u8,
        #[source]
        source: BusError,
    },

    #[error("Yaw calibration rejected: offset {offset:.3} deg/s exceeds {limit:.3} deg/s")]
    CalibrationAnomaly { offset: f32, limit: f32 },

    #[error("At least one sample is required")]
    NoSamples,
}

/// Anything that can produce scaled inertial samples
///
/// Reads are blocking. Only the single-shot reads belong in a control loop;
/// the averaged variants are for static queries.
pub trait ImuSource {
    fn read_sample(&mut self) -> Result<OrientationSample, SensorError>;

    /// Yaw rate in deg/s. Sensors with a cheaper single-register read should
    /// override this.
    fn read_yaw_rate(&mut self) -> Result<f32, SensorError> {
        Ok(self.read_sample()?.gyro_z)
    }

    fn read_axis(&mut self, axis: Axis) -> Result<f32, SensorError> {
        Ok(self.read_sample()?.axis(axis))
    }

    /// Mean of `n_samples` samples, sleeping `delay` between reads
    fn read_averaged(
        &mut self,
        n_samples: usize,
        delay: Duration,
    ) -> Result<OrientationSample, SensorError> {
        if n_samples == 0 {
            return Err(SensorError::NoSamples);
        }
        let mut sum = OrientationSample::default();
        for _ in 0..n_samples {
            sum.add(&self.read_sample()?);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        Ok(sum.scaled(1.0 / n_samples as f32))
    }

    fn read_axis_averaged(
        &mut self,
        axis: Axis,
        n_samples: usize,
        delay: Duration,
    ) -> Result<f32, SensorError> {
        if n_samples == 0 {
            return Err(SensorError::NoSamples);
        }
        let mut sum = 0.0;
        for _ in 0..n_samples {
            sum += self.read_axis(axis)?;
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        Ok(sum / n_samples as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        next: f32,
    }

    impl ImuSource for Counter {
        fn read_sample(&mut self) -> Result<OrientationSample, SensorError> {
            self.next += 1.0;
            Ok(OrientationSample {
                gyro_z: self.next,
                accel_z: 1.0,
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_averaging() {
        let mut imu = Counter { next: 0.0 };
        let avg = imu.read_averaged(4, Duration::ZERO).unwrap();
        // 1 + 2 + 3 + 4 = 10
        assert!((avg.gyro_z - 2.5).abs() < 1e-6);
        assert!((avg.accel_z - 1.0).abs() < 1e-6);

        let z = imu.read_axis_averaged(Axis::GyroZ, 2, Duration::ZERO).unwrap();
        assert!((z - 5.5).abs() < 1e-6);
    }

    #[test]
    fn test_zero_samples_rejected() {
        let mut imu = Counter { next: 0.0 };
        assert!(matches!(
            imu.read_averaged(0, Duration::ZERO),
            Err(SensorError::NoSamples)
        ));
    }
}
