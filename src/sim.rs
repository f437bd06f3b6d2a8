// Simulated robot body for host runs and tests
//
// The four PWM lines and the IMU register bus share one world. The gyro Z
// register reports a yaw rate proportional to the difference between the
// signed left and right wheel duties, plus a constant bias, so the closed
// loops in the motion controller behave as they would on the robot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::behavior::{AudioPlayer, CardReader, CardUid, Display, LineSensors, PeripheralError};
use crate::config::{DriveConfig, ImuConfig, RobotConfig, SimConfig};
use crate::dispatch::{CommandDispatcher, Companions};
use crate::imu::mpu6050::reg;
use crate::imu::{AccelRange, BusError, GyroRange, Mpu6050, OrientationEstimator, RegisterBus, SensorError};
use crate::motion::{AbortSignal, MotionController};
use crate::motor::{ActuatorError, DifferentialDrive, PwmOutput};

pub type SimController = MotionController<Mpu6050<SimBus>, SimPwm>;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Simulated IMU failed: {0}")]
    Sensor(#[from] SensorError),

    #[error("Simulated drive failed: {0}")]
    Actuator(#[from] ActuatorError),
}

struct SimState {
    config: SimConfig,
    duties: [f32; 4],
    regs: [u8; 256],
    stalled: bool,
    failing_reads: u32,
    bus_held: bool,
    bus_releases: u64,
    line: (u16, u16),
    obstacle: VecDeque<u16>,
    card: Option<CardUid>,
    emotions: Vec<String>,
    tracks: Vec<String>,
    playing_until: Option<Instant>,
}

impl SimState {
    /// Yaw rate in deg/s produced by the current wheel duties
    fn yaw_rate(&self) -> f32 {
        if self.stalled {
            return self.config.gyro_bias_dps;
        }
        let left = self.duties[0] - self.duties[1];
        let right = self.duties[2] - self.duties[3];
        self.config.yaw_gain_dps * (left - right) + self.config.gyro_bias_dps
    }

    fn write_word(&mut self, register: u8, value: i16) {
        let [hi, lo] = value.to_be_bytes();
        self.regs[register as usize] = hi;
        self.regs[register as usize + 1] = lo;
    }

    /// Refresh the output registers from the world state
    fn refresh_outputs(&mut self) {
        let gyro = GyroRange::from_bits(self.regs[reg::GYRO_CONFIG as usize]);
        let accel = AccelRange::from_bits(self.regs[reg::ACCEL_CONFIG as usize]);
        let counts = |value: f32, scale: f32| (value / scale).round().clamp(-32768.0, 32767.0) as i16;

        let yaw = counts(self.yaw_rate(), gyro.scale());
        let one_g = counts(1.0, accel.scale());
        self.write_word(reg::ACCEL_XOUT_H, 0);
        self.write_word(reg::ACCEL_YOUT_H, 0);
        self.write_word(reg::ACCEL_ZOUT_H, one_g);
        self.write_word(reg::TEMP_OUT_H, 0);
        self.write_word(reg::GYRO_XOUT_H, 0);
        self.write_word(reg::GYRO_YOUT_H, 0);
        self.write_word(reg::GYRO_ZOUT_H, yaw);
    }
}

/// Shared handle to the simulated robot
#[derive(Clone)]
pub struct SimWorld {
    inner: Arc<Mutex<SimState>>,
}

impl SimWorld {
    pub fn new(config: SimConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                stalled: config.stalled,
                config,
                duties: [0.0; 4],
                regs: [0; 256],
                failing_reads: 0,
                bus_held: false,
                bus_releases: 0,
                line: (0, 0),
                obstacle: VecDeque::new(),
                card: None,
                emotions: Vec::new(),
                tracks: Vec::new(),
                playing_until: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicking test thread must not wedge every other handle
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Motor driver wired to this world's four lines
    pub fn drive(&self, config: DriveConfig) -> Result<DifferentialDrive<SimPwm>, ActuatorError> {
        DifferentialDrive::new(
            self.pwm(0),
            self.pwm(1),
            self.pwm(2),
            self.pwm(3),
            config,
        )
    }

    /// IMU driver on this world's register bus
    pub fn imu(&self, config: &ImuConfig) -> Result<Mpu6050<SimBus>, SensorError> {
        Mpu6050::new(
            SimBus {
                world: self.clone(),
            },
            config.address,
            config.gyro_range,
            config.accel_range,
        )
    }

    /// Motion controller over this world's IMU and drive, calibrated while
    /// the robot stands still
    pub fn controller(&self, config: &RobotConfig, abort: AbortSignal) -> Result<SimController, SimError> {
        let imu = self.imu(&config.imu)?;
        let drive = self.drive(config.drive.clone())?;
        let mut estimator = OrientationEstimator::new(imu, &config.imu);
        estimator.calibrate_full()?;
        Ok(MotionController::new(estimator, drive, config.motion.clone()).with_abort_signal(abort))
    }

    /// Complete simulated robot behind a command dispatcher
    pub fn dispatcher(
        &self,
        config: &RobotConfig,
        abort: AbortSignal,
    ) -> Result<CommandDispatcher<SimController>, SimError> {
        let companions = Companions {
            sensors: Box::new(self.line_sensors()),
            cards: Box::new(self.card_reader()),
            audio: Box::new(self.audio()),
            display: Box::new(self.display()),
        };
        Ok(CommandDispatcher::new(
            self.controller(config, abort)?,
            companions,
            config.dispatch.clone(),
            config.behavior.clone(),
        ))
    }

    fn pwm(&self, line: usize) -> SimPwm {
        SimPwm {
            world: self.clone(),
            line,
        }
    }

    pub fn line_sensors(&self) -> SimLineSensors {
        SimLineSensors { world: self.clone() }
    }

    pub fn card_reader(&self) -> SimCardReader {
        SimCardReader { world: self.clone() }
    }

    pub fn audio(&self) -> SimAudio {
        SimAudio { world: self.clone() }
    }

    pub fn display(&self) -> SimDisplay {
        SimDisplay { world: self.clone() }
    }

    /// [left fwd, left rev, right fwd, right rev]
    pub fn duties(&self) -> [f32; 4] {
        self.lock().duties
    }

    pub fn is_coasting(&self) -> bool {
        self.duties() == [0.0; 4]
    }

    pub fn yaw_rate(&self) -> f32 {
        self.lock().yaw_rate()
    }

    /// Wheels spin but the robot does not turn
    pub fn set_stalled(&self, stalled: bool) {
        self.lock().stalled = stalled;
    }

    pub fn set_gyro_bias(&self, bias_dps: f32) {
        self.lock().config.gyro_bias_dps = bias_dps;
    }

    /// Make the next `count` bus reads NACK
    pub fn fail_next_reads(&self, count: u32) {
        self.lock().failing_reads = count;
    }

    pub fn bus_held(&self) -> bool {
        self.lock().bus_held
    }

    /// Stop conditions seen on the bus
    pub fn bus_releases(&self) -> u64 {
        self.lock().bus_releases
    }

    /// Raw (left, right) line sensor readings
    pub fn set_line(&self, left: u16, right: u16) {
        self.lock().line = (left, right);
    }

    /// Queue obstacle readings; the last one repeats
    pub fn push_obstacle(&self, readings: &[u16]) {
        self.lock().obstacle.extend(readings.iter().copied());
    }

    /// Slide a card under the reader; the next scan picks it up
    pub fn place_card(&self, uid: &[u8]) {
        self.lock().card = Some(CardUid(uid.to_vec()));
    }

    pub fn emotions(&self) -> Vec<String> {
        self.lock().emotions.clone()
    }

    pub fn tracks(&self) -> Vec<String> {
        self.lock().tracks.clone()
    }
}

/// One simulated PWM line
pub struct SimPwm {
    world: SimWorld,
    line: usize,
}

impl PwmOutput for SimPwm {
    fn set_duty(&mut self, duty: f32) -> Result<(), ActuatorError> {
        if !(0.0..=1.0).contains(&duty) {
            return Err(ActuatorError::Pwm(format!("duty {} out of range", duty)));
        }
        self.world.lock().duties[self.line] = duty;
        Ok(())
    }
}

/// Simulated two-wire bus with an MPU-6050 register file behind it
pub struct SimBus {
    world: SimWorld,
}

impl RegisterBus for SimBus {
    fn start(&mut self) -> Result<(), BusError> {
        self.world.lock().bus_held = true;
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.world.lock();
        state.bus_held = false;
        state.bus_releases += 1;
    }

    fn write(&mut self, _address: u8, bytes: &[u8]) -> Result<(), BusError> {
        if let [register, value, ..] = bytes {
            self.world.lock().regs[*register as usize] = *value;
        }
        Ok(())
    }

    fn read_mem(&mut self, address: u8, register: u8, buf: &mut [u8]) -> Result<(), BusError> {
        let mut state = self.world.lock();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(BusError::Nack { address });
        }
        state.refresh_outputs();
        let start = register as usize;
        let end = start + buf.len();
        if end > state.regs.len() {
            return Err(BusError::Fault(format!("read past register 0x{:02X}", register)));
        }
        buf.copy_from_slice(&state.regs[start..end]);
        Ok(())
    }
}

pub struct SimLineSensors {
    world: SimWorld,
}

impl LineSensors for SimLineSensors {
    fn read_left(&mut self) -> Result<u16, PeripheralError> {
        Ok(self.world.lock().line.0)
    }

    fn read_right(&mut self) -> Result<u16, PeripheralError> {
        Ok(self.world.lock().line.1)
    }

    fn read_obstacle(&mut self) -> Result<u16, PeripheralError> {
        let mut state = self.world.lock();
        let reading = if state.obstacle.len() > 1 {
            state.obstacle.pop_front()
        } else {
            state.obstacle.front().copied()
        };
        Ok(reading.unwrap_or(u16::MAX))
    }
}

/// Reports each placed card once, as the robot drives over it
pub struct SimCardReader {
    world: SimWorld,
}

impl CardReader for SimCardReader {
    fn scan_card(&mut self) -> Result<Option<CardUid>, PeripheralError> {
        Ok(self.world.lock().card.take())
    }
}

/// Plays every track for the configured track length
pub struct SimAudio {
    world: SimWorld,
}

impl AudioPlayer for SimAudio {
    fn play(&mut self, track: &str) -> Result<(), PeripheralError> {
        let mut state = self.world.lock();
        let length = Duration::from_millis(state.config.track_length_ms);
        state.tracks.push(track.to_string());
        state.playing_until = Some(Instant::now() + length);
        Ok(())
    }

    fn is_playing(&self) -> bool {
        self.world
            .lock()
            .playing_until
            .is_some_and(|until| Instant::now() < until)
    }

    fn stop(&mut self) {
        self.world.lock().playing_until = None;
    }
}

pub struct SimDisplay {
    world: SimWorld,
}

impl Display for SimDisplay {
    fn set_emotion(&mut self, name: &str) {
        self.world.lock().emotions.push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::ImuSource;
    use crate::motor::WheelCommand;

    #[test]
    fn test_imu_reports_bias_when_still() {
        let world = SimWorld::new(SimConfig {
            gyro_bias_dps: 1.25,
            ..Default::default()
        });
        let mut imu = world.imu(&ImuConfig::default()).unwrap();
        let sample = imu.read_sample().unwrap();
        assert!((sample.gyro_z - 1.25).abs() < 0.02);
        assert!((sample.accel_z - 1.0).abs() < 1e-3);
        assert!(!world.bus_held());
    }

    #[test]
    fn test_spin_produces_yaw() {
        let world = SimWorld::new(SimConfig {
            gyro_bias_dps: 0.0,
            ..Default::default()
        });
        let mut drive = world.drive(DriveConfig::default()).unwrap();
        let mut imu = world.imu(&ImuConfig::default()).unwrap();

        // left backward, right forward
        drive.apply(WheelCommand::new(-90, 90)).unwrap();
        let rate = imu.read_yaw_rate().unwrap();
        assert!(rate < -100.0, "rate {}", rate);
        assert!((rate - world.yaw_rate()).abs() < 0.05);
    }

    #[test]
    fn test_failing_reads() {
        let world = SimWorld::new(SimConfig::default());
        let mut imu = world.imu(&ImuConfig::default()).unwrap();
        let released = world.bus_releases();
        world.fail_next_reads(1);
        assert!(imu.read_yaw_rate().is_err());
        assert!(!world.bus_held());
        assert!(imu.read_yaw_rate().is_ok());
        assert_eq!(world.bus_releases(), released + 2);
    }

    #[test]
    fn test_controller_starts_calibrated() {
        let world = SimWorld::new(SimConfig {
            gyro_bias_dps: 2.0,
            ..Default::default()
        });
        let config = RobotConfig {
            imu: ImuConfig {
                full_calibration_samples: 20,
                ..Default::default()
            },
            ..Default::default()
        };
        let motion = world.controller(&config, AbortSignal::never()).unwrap();
        let offsets = motion.estimator().offsets();
        assert!((offsets.gyro_z - 2.0).abs() < 0.02);
        assert!((offsets.accel_z - 1.0).abs() < 1e-3);

        world.set_gyro_bias(25.0);
        assert!(matches!(
            world.controller(&config, AbortSignal::never()),
            Err(SimError::Sensor(SensorError::CalibrationAnomaly { .. }))
        ));
    }
}
