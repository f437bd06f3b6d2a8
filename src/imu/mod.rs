// Orientation sensing for the robot body
//
// Provides:
// - A two-wire register bus abstraction with guaranteed release
// - An MPU-6050 class accelerometer/gyroscope driver
// - The orientation estimator (yaw integration + complementary filter)

mod bus;
pub mod estimator;
pub mod mpu6050;
mod source;

pub use bus::{BusError, BusTransaction, RegisterBus};
pub use estimator::{
    wrap_signed, wrap_unsigned, CalibrationOffsets, OrientationEstimator, OrientationState,
    YawCalibration,
};
pub use mpu6050::{AccelRange, GyroRange, Mpu6050, RawAxes};
pub use source::{Axis, ImuSource, OrientationSample, SensorError};
