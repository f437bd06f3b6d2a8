// MPU-6050 class accelerometer/gyroscope driver
//
// Register map: all outputs are big-endian signed 16-bit values.
// The 14-byte burst at ACCEL_XOUT_H is [ax, ay, az, temp, gx, gy, gz].

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::bus::{BusTransaction, RegisterBus};
use super::source::{Axis, ImuSource, OrientationSample, SensorError};

pub const DEFAULT_ADDRESS: u8 = 0x68;

/// Register addresses
pub mod reg {
    pub const CONFIG: u8 = 0x1A;
    pub const GYRO_CONFIG: u8 = 0x1B;
    pub const ACCEL_CONFIG: u8 = 0x1C;
    pub const ACCEL_XOUT_H: u8 = 0x3B;
    pub const ACCEL_YOUT_H: u8 = 0x3D;
    pub const ACCEL_ZOUT_H: u8 = 0x3F;
    pub const TEMP_OUT_H: u8 = 0x41;
    pub const GYRO_XOUT_H: u8 = 0x43;
    pub const GYRO_YOUT_H: u8 = 0x45;
    pub const GYRO_ZOUT_H: u8 = 0x47;
    pub const PWR_MGMT_1: u8 = 0x6B;
}

/// Digital low-pass filter setting written at init (~184 Hz bandwidth)
const DLPF_CONFIG: u8 = 1;

/// Gyroscope full-scale range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GyroRange {
    Dps250,
    Dps500,
    Dps1000,
    Dps2000,
}

impl GyroRange {
    pub fn config_bits(self) -> u8 {
        match self {
            Self::Dps250 => 0x00,
            Self::Dps500 => 0x08,
            Self::Dps1000 => 0x10,
            Self::Dps2000 => 0x18,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x18 {
            0x00 => Self::Dps250,
            0x08 => Self::Dps500,
            0x10 => Self::Dps1000,
            _ => Self::Dps2000,
        }
    }

    pub fn full_scale(self) -> f32 {
        match self {
            Self::Dps250 => 250.0,
            Self::Dps500 => 500.0,
            Self::Dps1000 => 1000.0,
            Self::Dps2000 => 2000.0,
        }
    }

    /// deg/s per raw count
    pub fn scale(self) -> f32 {
        self.full_scale() / 32768.0
    }
}

/// Accelerometer full-scale range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccelRange {
    G2,
    G4,
    G8,
    G16,
}

impl AccelRange {
    pub fn config_bits(self) -> u8 {
        match self {
            Self::G2 => 0x00,
            Self::G4 => 0x08,
            Self::G8 => 0x10,
            Self::G16 => 0x18,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x18 {
            0x00 => Self::G2,
            0x08 => Self::G4,
            0x10 => Self::G8,
            _ => Self::G16,
        }
    }

    pub fn full_scale(self) -> f32 {
        match self {
            Self::G2 => 2.0,
            Self::G4 => 4.0,
            Self::G8 => 8.0,
            Self::G16 => 16.0,
        }
    }

    /// g per raw count
    pub fn scale(self) -> f32 {
        self.full_scale() / 32768.0
    }
}

/// Unscaled counts from one burst read
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawAxes {
    pub accel: [i16; 3],
    pub gyro: [i16; 3],
    /// Die temperature in degrees Celsius
    pub temperature_c: f32,
}

impl RawAxes {
    pub fn from_bytes(data: &[u8; 14]) -> Self {
        let word = |i: usize| i16::from_be_bytes([data[i], data[i + 1]]);
        Self {
            accel: [word(0), word(2), word(4)],
            temperature_c: word(6) as f32 / 340.0 + 36.53,
            gyro: [word(8), word(10), word(12)],
        }
    }
}

fn axis_register(axis: Axis) -> u8 {
    match axis {
        Axis::AccelX => reg::ACCEL_XOUT_H,
        Axis::AccelY => reg::ACCEL_YOUT_H,
        Axis::AccelZ => reg::ACCEL_ZOUT_H,
        Axis::GyroX => reg::GYRO_XOUT_H,
        Axis::GyroY => reg::GYRO_YOUT_H,
        Axis::GyroZ => reg::GYRO_ZOUT_H,
    }
}

/// MPU-6050 on a register bus
pub struct Mpu6050<B: RegisterBus> {
    bus: B,
    address: u8,
    gyro_range: GyroRange,
    accel_range: AccelRange,
}

impl<B: RegisterBus> Mpu6050<B> {
    /// Wake the sensor, configure filter and ranges, then read the ranges
    /// back so scaling matches what the device actually accepted.
    pub fn new(
        bus: B,
        address: u8,
        gyro_range: GyroRange,
        accel_range: AccelRange,
    ) -> Result<Self, SensorError> {
        let mut imu = Self {
            bus,
            address,
            gyro_range,
            accel_range,
        };

        imu.write_register(reg::PWR_MGMT_1, 0)?;
        imu.write_register(reg::CONFIG, DLPF_CONFIG)?;
        imu.write_register(reg::GYRO_CONFIG, gyro_range.config_bits())?;
        imu.write_register(reg::ACCEL_CONFIG, accel_range.config_bits())?;
        imu.read_scale_ranges()?;

        info!(
            "IMU 0x{:02X} ready: gyro ±{} deg/s, accel ±{} g",
            address,
            imu.gyro_range.full_scale(),
            imu.accel_range.full_scale()
        );
        Ok(imu)
    }

    fn read_scale_ranges(&mut self) -> Result<(), SensorError> {
        let mut byte = [0u8; 1];
        self.read_registers(reg::GYRO_CONFIG, &mut byte)?;
        self.gyro_range = GyroRange::from_bits(byte[0]);

        self.read_registers(reg::ACCEL_CONFIG, &mut byte)?;
        self.accel_range = AccelRange::from_bits(byte[0]);
        Ok(())
    }

    pub fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError> {
        debug!("IMU write reg=0x{:02X} value=0x{:02X}", register, value);
        let mut tx = BusTransaction::begin(&mut self.bus)
            .map_err(|source| SensorError::Bus { register, source })?;
        tx.write(self.address, &[register, value])
            .map_err(|source| SensorError::Bus { register, source })
    }

    /// Read consecutive registers. The bus is released on every path.
    pub fn read_registers(&mut self, register: u8, buf: &mut [u8]) -> Result<(), SensorError> {
        let mut tx = BusTransaction::begin(&mut self.bus)
            .map_err(|source| SensorError::Bus { register, source })?;
        tx.read_mem(self.address, register, buf)
            .map_err(|source| SensorError::Bus { register, source })
    }

    pub fn read_raw(&mut self) -> Result<RawAxes, SensorError> {
        let mut data = [0u8; 14];
        self.read_registers(reg::ACCEL_XOUT_H, &mut data)?;
        Ok(RawAxes::from_bytes(&data))
    }

    pub fn read_raw_axis(&mut self, axis: Axis) -> Result<i16, SensorError> {
        let mut data = [0u8; 2];
        self.read_registers(axis_register(axis), &mut data)?;
        Ok(i16::from_be_bytes(data))
    }

    fn scale_for(&self, axis: Axis) -> f32 {
        match axis {
            Axis::AccelX | Axis::AccelY | Axis::AccelZ => self.accel_range.scale(),
            Axis::GyroX | Axis::GyroY | Axis::GyroZ => self.gyro_range.scale(),
        }
    }

    pub fn gyro_range(&self) -> GyroRange {
        self.gyro_range
    }

    pub fn accel_range(&self) -> AccelRange {
        self.accel_range
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }
}

impl<B: RegisterBus> ImuSource for Mpu6050<B> {
    fn read_sample(&mut self) -> Result<OrientationSample, SensorError> {
        let raw = self.read_raw()?;
        let a = self.accel_range.scale();
        let g = self.gyro_range.scale();
        Ok(OrientationSample {
            accel_x: raw.accel[0] as f32 * a,
            accel_y: raw.accel[1] as f32 * a,
            accel_z: raw.accel[2] as f32 * a,
            gyro_x: raw.gyro[0] as f32 * g,
            gyro_y: raw.gyro[1] as f32 * g,
            gyro_z: raw.gyro[2] as f32 * g,
        })
    }

    fn read_yaw_rate(&mut self) -> Result<f32, SensorError> {
        self.read_axis(Axis::GyroZ)
    }

    fn read_axis(&mut self, axis: Axis) -> Result<f32, SensorError> {
        Ok(self.read_raw_axis(axis)? as f32 * self.scale_for(axis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::BusError;

    /// Register-file bus; reads can be made to fail
    struct MockBus {
        regs: [u8; 128],
        held: bool,
        starts: u32,
        stops: u32,
        fail_reads: bool,
    }

    impl MockBus {
        fn new() -> Self {
            Self {
                regs: [0; 128],
                held: false,
                starts: 0,
                stops: 0,
                fail_reads: false,
            }
        }

        fn set_word(&mut self, register: u8, value: i16) {
            let [hi, lo] = value.to_be_bytes();
            self.regs[register as usize] = hi;
            self.regs[register as usize + 1] = lo;
        }
    }

    impl RegisterBus for MockBus {
        fn start(&mut self) -> Result<(), BusError> {
            self.starts += 1;
            self.held = true;
            Ok(())
        }

        fn stop(&mut self) {
            self.stops += 1;
            self.held = false;
        }

        fn write(&mut self, _address: u8, bytes: &[u8]) -> Result<(), BusError> {
            self.regs[bytes[0] as usize] = bytes[1];
            Ok(())
        }

        fn read_mem(&mut self, address: u8, register: u8, buf: &mut [u8]) -> Result<(), BusError> {
            if self.fail_reads {
                return Err(BusError::Nack { address });
            }
            let start = register as usize;
            buf.copy_from_slice(&self.regs[start..start + buf.len()]);
            Ok(())
        }
    }

    fn sensor() -> Mpu6050<MockBus> {
        Mpu6050::new(MockBus::new(), DEFAULT_ADDRESS, GyroRange::Dps500, AccelRange::G4).unwrap()
    }

    #[test]
    fn test_init_writes_config() {
        let imu = sensor();
        assert_eq!(imu.bus.regs[reg::PWR_MGMT_1 as usize], 0);
        assert_eq!(imu.bus.regs[reg::CONFIG as usize], 1);
        assert_eq!(imu.bus.regs[reg::GYRO_CONFIG as usize], 0x08);
        assert_eq!(imu.bus.regs[reg::ACCEL_CONFIG as usize], 0x08);
        assert_eq!(imu.gyro_range(), GyroRange::Dps500);
        assert_eq!(imu.accel_range(), AccelRange::G4);
        assert_eq!(imu.bus.starts, imu.bus.stops);
    }

    #[test]
    fn test_range_bits_roundtrip() {
        for range in [GyroRange::Dps250, GyroRange::Dps500, GyroRange::Dps1000, GyroRange::Dps2000] {
            assert_eq!(GyroRange::from_bits(range.config_bits()), range);
        }
        assert_eq!(AccelRange::from_bits(0x10), AccelRange::G8);
        assert!((GyroRange::Dps500.scale() - 500.0 / 32768.0).abs() < 1e-9);
    }

    #[test]
    fn test_burst_decoding() {
        let mut imu = sensor();
        imu.bus.set_word(reg::ACCEL_ZOUT_H, 8192); // 1 g at ±4 g
        imu.bus.set_word(reg::TEMP_OUT_H, 0);
        imu.bus.set_word(reg::GYRO_ZOUT_H, -6554); // about -100 deg/s at ±500

        let raw = imu.read_raw().unwrap();
        assert_eq!(raw.accel, [0, 0, 8192]);
        assert_eq!(raw.gyro, [0, 0, -6554]);
        assert!((raw.temperature_c - 36.53).abs() < 1e-4);

        let sample = imu.read_sample().unwrap();
        assert!((sample.accel_z - 1.0).abs() < 1e-4);
        assert!((sample.gyro_z + 100.0).abs() < 0.01);

        let yaw = imu.read_yaw_rate().unwrap();
        assert!((yaw - sample.gyro_z).abs() < 1e-6);
    }

    #[test]
    fn test_failed_read_releases_bus() {
        let mut imu = sensor();
        imu.bus.fail_reads = true;

        let err = imu.read_sample().unwrap_err();
        assert!(matches!(
            err,
            SensorError::Bus {
                register: reg::ACCEL_XOUT_H,
                source: BusError::Nack { .. }
            }
        ));
        assert!(!imu.bus.held, "bus left held after failed read");
        assert_eq!(imu.bus.starts, imu.bus.stops);

        assert!(imu.read_yaw_rate().is_err());
        assert!(!imu.bus.held);
    }
}
