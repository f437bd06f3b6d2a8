// Motion controller
//
// Owns the orientation estimator and the drive. Every primitive runs the
// wheels through an `Engaged` guard, so the motors coast whichever way the
// primitive ends: success, error, abort, or the future being dropped.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::schedule::{heading_correction, ramp_speed, ramp_start, turn_band_command, turn_target};
use super::{AbortSignal, MotionError, MotionPrimitives, MotionReport, MotionRequest};
use crate::config::MotionConfig;
use crate::imu::{ImuSource, OrientationEstimator, SensorError};
use crate::motor::{DifferentialDrive, PwmOutput, WheelCommand};

/// Drive borrowed for the length of one primitive; coasts on drop
struct Engaged<'a, P: PwmOutput> {
    drive: &'a mut DifferentialDrive<P>,
}

impl<'a, P: PwmOutput> Engaged<'a, P> {
    fn new(drive: &'a mut DifferentialDrive<P>) -> Self {
        Self { drive }
    }
}

impl<P: PwmOutput> Deref for Engaged<'_, P> {
    type Target = DifferentialDrive<P>;

    fn deref(&self) -> &Self::Target {
        self.drive
    }
}

impl<P: PwmOutput> DerefMut for Engaged<'_, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.drive
    }
}

impl<P: PwmOutput> Drop for Engaged<'_, P> {
    fn drop(&mut self) {
        if let Err(e) = self.drive.coast() {
            warn!("Failed to coast after primitive: {}", e);
        }
    }
}

/// State of one `turn_by_angle` call
#[derive(Debug, Clone, Copy)]
pub struct TurnSession {
    /// Yaw distance at which the turn ends, in degrees
    pub target_angle: f32,
    /// 1 turns right, -1 turns left
    pub speed_factor: i16,
    pub started: Instant,
    pub last_tick: Instant,
}

impl TurnSession {
    pub fn new(angle: f32, config: &MotionConfig, accumulated_error: f32) -> Self {
        let (target_angle, speed_factor) =
            turn_target(angle, config.turn_angle_buffer_deg, accumulated_error);
        let now = Instant::now();
        Self {
            target_angle,
            speed_factor,
            started: now,
            last_tick: now,
        }
    }

    pub fn command(&self, distance: f32, config: &MotionConfig) -> WheelCommand {
        turn_band_command(distance, self.target_angle, self.speed_factor, config)
    }
}

/// Counts consecutive failed reads and decides when to give up
struct FailureBudget {
    limit: u32,
    consecutive: u32,
}

impl FailureBudget {
    fn new(limit: u32) -> Self {
        Self { limit, consecutive: 0 }
    }

    fn success(&mut self) {
        self.consecutive = 0;
    }

    fn failure(&mut self, err: SensorError) -> Result<(), MotionError> {
        self.consecutive += 1;
        if self.consecutive > self.limit {
            warn!("{} consecutive sensor failures, giving up", self.consecutive);
            return Err(err.into());
        }
        debug!("Sensor read failed ({}): {}", self.consecutive, err);
        Ok(())
    }
}

/// Calibrate before a yaw-dependent primitive. An anomalous offset gets one
/// retry; a second anomaly or a failed read ends the primitive.
fn calibrate<S: ImuSource>(estimator: &mut OrientationEstimator<S>) -> Result<(), MotionError> {
    let samples = estimator.yaw_samples();
    match estimator.calibrate_yaw(samples) {
        Ok(_) => Ok(()),
        Err(SensorError::CalibrationAnomaly { offset, limit }) => {
            warn!("Yaw calibration anomaly ({:.2} > {:.2} deg/s), retrying", offset, limit);
            estimator.calibrate_yaw(samples)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Keep the first error; log a cleanup failure that follows it
fn merge(result: Result<MotionReport, MotionError>, cleanup: Result<(), MotionError>) -> Result<MotionReport, MotionError> {
    match (result, cleanup) {
        (Ok(report), Ok(())) => Ok(report),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => {
            warn!("Cleanup failed after {}: {}", e, cleanup);
            Err(e)
        }
    }
}

async fn straight_loop<S: ImuSource, P: PwmOutput>(
    estimator: &mut OrientationEstimator<S>,
    drive: &mut DifferentialDrive<P>,
    config: &MotionConfig,
    abort: &AbortSignal,
    speed: i16,
    duration: Duration,
) -> Result<MotionReport, MotionError> {
    tokio::time::sleep(config.settle()).await;
    abort.check()?;
    calibrate(estimator)?;
    estimator.reset_integration();

    drive.apply(WheelCommand::straight(ramp_start(speed, config)))?;

    let started = Instant::now();
    let mut report = MotionReport::default();
    let mut failures = FailureBudget::new(config.max_sensor_failures);

    loop {
        abort.check()?;
        let elapsed = started.elapsed();
        if elapsed >= duration {
            break;
        }

        let remaining = (duration - elapsed).as_secs_f32() / duration.as_secs_f32();
        let current = ramp_speed(speed, remaining, config);

        match estimator.update_yaw() {
            Ok(_) => {
                failures.success();
                let yaw = estimator.normalized_signed();
                match heading_correction(current, yaw, config) {
                    Some(cmd) => drive.apply(cmd)?,
                    None => {
                        debug!("Yaw {:.2} looks like a glitch, skipping correction", yaw);
                        report.skipped_corrections += 1;
                    }
                }
            }
            Err(e) => {
                report.skipped_corrections += 1;
                failures.failure(e)?;
            }
        }

        report.ticks += 1;
        abort.sleep(config.straight_tick()).await?;
    }

    report.final_yaw = estimator.normalized_signed();
    report.elapsed = started.elapsed();
    Ok(report)
}

async fn turn_loop<S: ImuSource, P: PwmOutput>(
    estimator: &mut OrientationEstimator<S>,
    drive: &mut DifferentialDrive<P>,
    config: &MotionConfig,
    abort: &AbortSignal,
    angle: f32,
    accumulated_error: f32,
) -> Result<(MotionReport, TurnSession), MotionError> {
    drive.brake().await?;
    tokio::time::sleep(config.settle()).await;
    abort.check()?;
    calibrate(estimator)?;
    estimator.reset_integration();
    tokio::time::sleep(config.turn_settle()).await;

    let mut session = TurnSession::new(angle, config, accumulated_error);
    let mut report = MotionReport::default();
    let mut failures = FailureBudget::new(config.max_sensor_failures);
    let mut distance = 0.0;
    debug!(
        "Turn target {:.1} deg, factor {}",
        session.target_angle, session.speed_factor
    );

    drive.apply(session.command(distance, config))?;

    loop {
        abort.check()?;
        let elapsed = session.started.elapsed();
        if elapsed > config.turn_timeout() {
            drive.stop().await?;
            warn!(
                "Turn timed out at {:.1} of {:.1} deg",
                distance, session.target_angle
            );
            return Err(MotionError::Timeout {
                target_deg: session.target_angle,
                reached_deg: distance,
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        match estimator.update_yaw() {
            Ok(yaw) => {
                failures.success();
                distance = yaw.abs().trunc();
                if distance >= session.target_angle {
                    break;
                }
                drive.apply(session.command(distance, config))?;
            }
            Err(e) => {
                report.skipped_corrections += 1;
                failures.failure(e)?;
            }
        }

        report.ticks += 1;
        session.last_tick = Instant::now();
        abort.sleep(config.turn_tick()).await?;
    }

    report.final_yaw = estimator.normalized_signed();
    report.elapsed = session.started.elapsed();
    Ok((report, session))
}

/// Closed-loop motion over an owned sensor and drive
pub struct MotionController<S: ImuSource, P: PwmOutput> {
    estimator: OrientationEstimator<S>,
    drive: DifferentialDrive<P>,
    config: MotionConfig,
    abort: AbortSignal,
    accumulated_angle_error: f32,
}

impl<S: ImuSource, P: PwmOutput> MotionController<S, P> {
    pub fn new(estimator: OrientationEstimator<S>, drive: DifferentialDrive<P>, config: MotionConfig) -> Self {
        Self {
            estimator,
            drive,
            config,
            abort: AbortSignal::never(),
            accumulated_angle_error: 0.0,
        }
    }

    pub fn with_abort_signal(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub async fn forward(&mut self, steps: Option<u32>) -> Result<MotionReport, MotionError> {
        self.execute(MotionRequest::Forward { steps }).await
    }

    pub async fn backward(&mut self, steps: Option<u32>) -> Result<MotionReport, MotionError> {
        self.execute(MotionRequest::Backward { steps }).await
    }

    /// Turn left by `angle` degrees, the default step turn if `None`
    pub async fn turn_left(&mut self, angle: Option<f32>) -> Result<MotionReport, MotionError> {
        let angle = angle.unwrap_or(self.config.default_turn_deg);
        self.execute(MotionRequest::TurnLeft { angle: Some(angle) }).await
    }

    pub async fn turn_right(&mut self, angle: Option<f32>) -> Result<MotionReport, MotionError> {
        let angle = angle.unwrap_or(self.config.default_turn_deg);
        self.execute(MotionRequest::TurnRight { angle: Some(angle) }).await
    }

    /// Dynamic brake for the configured brake time; lines stay braked
    pub async fn brake(&mut self) -> Result<(), MotionError> {
        self.drive.brake().await?;
        Ok(())
    }

    /// Carried into every turn target. Turns currently leave it at zero.
    pub fn accumulated_angle_error(&self) -> f32 {
        self.accumulated_angle_error
    }

    pub fn reset_angle_error(&mut self) {
        self.accumulated_angle_error = 0.0;
    }

    fn record_turn_residual(&self, session: &TurnSession, reached: f32) {
        let residual = reached - session.target_angle;
        debug!(
            "Turn residual {:.2} deg (accumulated {:.2})",
            residual, self.accumulated_angle_error
        );
    }

    pub fn estimator(&self) -> &OrientationEstimator<S> {
        &self.estimator
    }

    pub fn estimator_mut(&mut self) -> &mut OrientationEstimator<S> {
        &mut self.estimator
    }

    pub fn drive(&self) -> &DifferentialDrive<P> {
        &self.drive
    }
}

impl<S: ImuSource, P: PwmOutput> MotionPrimitives for MotionController<S, P> {
    /// Drive straight for `duration`, holding the heading captured at start
    async fn drive_straight(&mut self, speed: i16, duration: Duration) -> Result<MotionReport, MotionError> {
        info!("Drive straight: speed={} duration={:?}", speed, duration);

        let config = &self.config;
        let mut drive = Engaged::new(&mut self.drive);
        let result = straight_loop(&mut self.estimator, &mut drive, config, &self.abort, speed, duration).await;

        let cleanup = async {
            tokio::time::sleep(config.settle()).await;
            drive.stop().await?;
            tokio::time::sleep(config.settle()).await;
            drive.coast()?;
            Ok::<(), MotionError>(())
        }
        .await;

        let result = merge(result, cleanup);
        match &result {
            Ok(report) => info!(
                "Straight done: yaw={:.2} ticks={} skipped={}",
                report.final_yaw, report.ticks, report.skipped_corrections
            ),
            Err(e) => warn!("Straight drive ended early: {}", e),
        }
        result
    }

    async fn turn_by_angle(&mut self, angle: f32) -> Result<MotionReport, MotionError> {
        info!("Turn by {:.1} deg", angle);

        let config = &self.config;
        let accumulated_error = self.accumulated_angle_error;
        let mut drive = Engaged::new(&mut self.drive);
        let result = turn_loop(&mut self.estimator, &mut drive, config, &self.abort, angle, accumulated_error).await;

        let cleanup = async {
            drive.brake().await?;
            tokio::time::sleep(config.turn_settle()).await;
            drive.coast()?;
            Ok::<(), MotionError>(())
        }
        .await;
        drop(drive);

        let result = match result {
            Ok((report, session)) => {
                self.record_turn_residual(&session, self.estimator.angle_z().abs().trunc());
                Ok(report)
            }
            Err(e) => Err(e),
        };
        let result = merge(result, cleanup);
        match &result {
            Ok(report) => info!("Turn done: yaw={:.2} in {:?}", report.final_yaw, report.elapsed),
            Err(MotionError::Timeout { .. }) => {}
            Err(e) => warn!("Turn ended early: {}", e),
        }
        result
    }

    async fn set_wheels(&mut self, cmd: WheelCommand) -> Result<(), MotionError> {
        self.drive.apply(cmd)?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), MotionError> {
        let result = self.drive.stop().await;
        self.drive.coast()?;
        result?;
        Ok(())
    }

    fn motion_config(&self) -> &MotionConfig {
        &self.config
    }

    fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriveConfig, ImuConfig, SimConfig};
    use crate::motion::abort_pair;
    use crate::sim::{SimBus, SimPwm, SimWorld};
    use crate::imu::Mpu6050;

    type SimController = MotionController<Mpu6050<SimBus>, SimPwm>;

    fn controller(world: &SimWorld) -> SimController {
        let imu_config = ImuConfig {
            yaw_calibration_samples: 200,
            ..Default::default()
        };
        let imu = world.imu(&imu_config).unwrap();
        let drive = world.drive(DriveConfig::default()).unwrap();
        MotionController::new(
            OrientationEstimator::new(imu, &imu_config),
            drive,
            MotionConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_straight_holds_heading_and_coasts() {
        let world = SimWorld::new(SimConfig::default());
        let mut motion = controller(&world);

        let report = motion
            .drive_straight(90, Duration::from_millis(1470))
            .await
            .unwrap();

        assert!(report.final_yaw.abs() < 2.0, "yaw {}", report.final_yaw);
        assert!(report.ticks > 200);
        assert!(report.elapsed >= Duration::from_millis(1470));
        assert!(world.is_coasting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_second_drive_ends_neutral_both_ways() {
        let world = SimWorld::new(SimConfig::default());
        let mut motion = controller(&world);

        for speed in [90, -90] {
            let report = motion.drive_straight(speed, Duration::from_secs(2)).await.unwrap();
            assert!(report.final_yaw.abs() < 2.0, "yaw {}", report.final_yaw);
            assert!(report.elapsed >= Duration::from_secs(2));
            assert!(world.is_coasting());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_biased_gyro_fails_primitive() {
        let world = SimWorld::new(SimConfig {
            gyro_bias_dps: 15.0,
            ..Default::default()
        });
        let mut motion = controller(&world);

        let err = motion.drive_straight(90, Duration::from_millis(1470)).await.unwrap_err();
        assert!(matches!(err, MotionError::Sensor(SensorError::CalibrationAnomaly { .. })));
        assert!(world.is_coasting());

        let err = motion.turn_by_angle(90.0).await.unwrap_err();
        assert!(matches!(err, MotionError::Sensor(SensorError::CalibrationAnomaly { .. })));
        assert!(world.is_coasting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bias_jump_keeps_last_good_offset() {
        let world = SimWorld::new(SimConfig::default());
        let mut motion = controller(&world);
        motion.turn_right(Some(45.0)).await.unwrap();
        let good = motion.estimator().offsets().gyro_z;
        assert!((good - 0.8).abs() < 0.05, "offset {}", good);

        world.set_gyro_bias(12.0);
        let result = motion.forward(Some(1)).await;
        assert!(matches!(result, Err(MotionError::Sensor(SensorError::CalibrationAnomaly { .. }))));
        assert_eq!(motion.estimator().offsets().gyro_z, good);
        assert!(world.is_coasting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_only_cleans_up() {
        let world = SimWorld::new(SimConfig::default());
        let mut motion = controller(&world);
        let report = motion.drive_straight(90, Duration::ZERO).await.unwrap();
        assert_eq!(report.ticks, 0);
        assert!(world.is_coasting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_turns_reach_target() {
        let world = SimWorld::new(SimConfig::default());
        let mut motion = controller(&world);

        for angle in [92.0_f32, -92.0] {
            let report = motion.turn_by_angle(angle).await.unwrap();
            let reached = motion.estimator().angle_z().abs();
            assert!(reached >= 87.0, "reached {}", reached);
            assert!(reached < 95.0, "overshoot {}", reached);
            assert!(report.elapsed < Duration::from_secs(2));
            assert!(world.is_coasting());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_direction_follows_sign() {
        let world = SimWorld::new(SimConfig::default());
        let mut motion = controller(&world);

        motion.turn_right(None).await.unwrap();
        let right = motion.estimator().angle_z();
        motion.turn_left(None).await.unwrap();
        let left = motion.estimator().angle_z();
        assert!(right.signum() != left.signum());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_turn_times_out() {
        let world = SimWorld::new(SimConfig::default());
        world.set_stalled(true);
        let mut motion = controller(&world);

        let err = motion.turn_by_angle(90.0).await.unwrap_err();
        match err {
            MotionError::Timeout {
                target_deg,
                reached_deg,
                elapsed_ms,
            } => {
                assert_eq!(target_deg, 85.0);
                assert!(reached_deg < 1.0);
                assert!((6000..=6010).contains(&elapsed_ms), "elapsed {}", elapsed_ms);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(world.is_coasting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_straight_drive() {
        let world = SimWorld::new(SimConfig::default());
        let (handle, signal) = abort_pair();
        let mut motion = controller(&world).with_abort_signal(signal);

        let start = Instant::now();
        let (result, _) = tokio::join!(motion.drive_straight(90, Duration::from_secs(5)), async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            handle.abort();
        });

        assert!(matches!(result, Err(MotionError::Aborted)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(world.is_coasting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_primitive_coasts() {
        let world = SimWorld::new(SimConfig::default());
        let mut motion = controller(&world);

        let timed_out =
            tokio::time::timeout(Duration::from_millis(500), motion.drive_straight(90, Duration::from_secs(5))).await;
        assert!(timed_out.is_err());
        assert!(world.is_coasting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_brief_sensor_failures_are_tolerated() {
        let world = SimWorld::new(SimConfig::default());
        let mut motion = controller(&world);

        let (result, _) = tokio::join!(motion.drive_straight(90, Duration::from_secs(1)), async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            world.fail_next_reads(3);
        });

        let report = result.unwrap();
        assert!(report.skipped_corrections >= 3);
        assert!(world.is_coasting());
        assert!(!world.bus_held());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_loss_aborts_primitive() {
        let world = SimWorld::new(SimConfig::default());
        let mut motion = controller(&world);

        let (result, _) = tokio::join!(motion.drive_straight(90, Duration::from_secs(5)), async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            world.fail_next_reads(1000);
        });

        assert!(matches!(result, Err(MotionError::Sensor(_))));
        assert!(world.is_coasting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_leaves_wheels_coasting() {
        let world = SimWorld::new(SimConfig::default());
        let mut motion = controller(&world);
        motion.set_wheels(WheelCommand::straight(80)).await.unwrap();
        assert!(!world.is_coasting());
        motion.stop().await.unwrap();
        assert!(world.is_coasting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accumulated_error_stays_zero() {
        let world = SimWorld::new(SimConfig::default());
        let mut motion = controller(&world);
        motion.turn_right(Some(45.0)).await.unwrap();
        assert_eq!(motion.accumulated_angle_error(), 0.0);
        motion.reset_angle_error();
        assert_eq!(motion.accumulated_angle_error(), 0.0);
    }
}
