// Composite behaviours built on the motion primitives
//
// Each behaviour is a cooperative loop that yields at its sleep points and
// returns as soon as the abort signal is raised, leaving the wheels coasting.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::BehaviorConfig;
use crate::motion::{AbortSignal, MotionError, MotionPrimitives};
use crate::motor::WheelCommand;

/// Error types for the robot's peripheral collaborators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeripheralError {
    #[error("Sensor read failed: {0}")]
    Sensor(String),

    #[error("Audio playback failed: {0}")]
    Audio(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BehaviorError {
    #[error(transparent)]
    Motion(#[from] MotionError),

    #[error(transparent)]
    Peripheral(#[from] PeripheralError),
}

/// Raw ADC counts from the two line sensors and the obstacle sensor
pub trait LineSensors {
    fn read_left(&mut self) -> Result<u16, PeripheralError>;
    fn read_right(&mut self) -> Result<u16, PeripheralError>;
    fn read_obstacle(&mut self) -> Result<u16, PeripheralError>;
}

pub trait AudioPlayer {
    /// Start playing a track; returns once playback has started
    fn play(&mut self, track: &str) -> Result<(), PeripheralError>;
    fn is_playing(&self) -> bool;
    fn stop(&mut self);
}

/// Card reader on the underside of the robot
pub trait CardReader {
    /// UID of the card under the reader, if any
    fn scan_card(&mut self) -> Result<Option<CardUid>, PeripheralError>;
}

/// Card identifier as read from the tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardUid(pub Vec<u8>);

impl CardUid {
    /// Every card plays the track named after its UID in upper-case hex
    pub fn track(&self) -> String {
        let hex: String = self.0.iter().map(|b| format!("{:02X}", b)).collect();
        format!("{}.wav", hex)
    }
}

/// Eye display; fire-and-forget
pub trait Display {
    fn set_emotion(&mut self, name: &str);
}

/// How a behaviour ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviorEnd {
    ObstacleAhead,
    TrackFinished,
    Aborted,
}

/// What the line follower does with one set of readings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStep {
    Obstacle,
    Drive(WheelCommand),
    /// Line lost: keep the previous command
    Keep,
}

/// A reading below a threshold means the sensor sees the line (or, for the
/// obstacle sensor, that something is close).
pub fn line_step(left: u16, right: u16, obstacle: Option<u16>, config: &BehaviorConfig) -> LineStep {
    if obstacle.is_some_and(|value| value < config.obstacle_threshold) {
        return LineStep::Obstacle;
    }

    let left_on_line = left < config.line_threshold_left;
    let right_on_line = right < config.line_threshold_right;
    match (left_on_line, right_on_line) {
        (true, true) => LineStep::Drive(WheelCommand::new(35, 35)),
        (false, true) => LineStep::Drive(WheelCommand::new(20, 80)),
        (true, false) => LineStep::Drive(WheelCommand::new(80, 20)),
        (false, false) => LineStep::Keep,
    }
}

// (left, right, hold ms)
const DANCE_ROUTINE: [(i16, i16, u64); 8] = [
    (100, 100, 500),
    (-100, -100, 500),
    (100, -100, 500),
    (-100, 100, 500),
    (100, 100, 500),
    (-100, -100, 500),
    (-100, 100, 500),
    (100, -100, 2000),
];

/// Coast and report an abort
async fn aborted<M: MotionPrimitives>(motion: &mut M) -> Result<BehaviorEnd, BehaviorError> {
    motion.set_wheels(WheelCommand::zero()).await?;
    info!("Behaviour aborted");
    Ok(BehaviorEnd::Aborted)
}

/// Sleep one tick; `false` if the abort signal fired
async fn tick(abort: &AbortSignal, duration: Duration) -> bool {
    abort.sleep(duration).await.is_ok()
}

/// Card reader plus the player for its tracks
pub struct CardAnnouncer<'a> {
    pub reader: &'a mut dyn CardReader,
    pub audio: &'a mut dyn AudioPlayer,
}

impl CardAnnouncer<'_> {
    /// Scan once. A card stops the robot and plays its track to the end.
    ///
    /// Returns `false` if the abort signal fired while the track played.
    pub async fn announce<M: MotionPrimitives>(
        &mut self,
        motion: &mut M,
        config: &BehaviorConfig,
    ) -> Result<bool, BehaviorError> {
        let Some(uid) = self.reader.scan_card()? else {
            return Ok(true);
        };
        let track = uid.track();
        info!("Card {:02X?} scanned, playing {}", uid.0, track);

        let abort = motion.abort_signal();
        motion.stop().await?;
        if !tick(&abort, config.card_pause()).await {
            return Ok(false);
        }

        self.audio.play(&track)?;
        while self.audio.is_playing() {
            if !tick(&abort, config.line_tick()).await {
                self.audio.stop();
                return Ok(false);
            }
        }
        motion.set_wheels(WheelCommand::zero()).await?;
        Ok(true)
    }
}

/// Follow the line until `keep_going` turns false
async fn follow_line_while<M: MotionPrimitives>(
    motion: &mut M,
    sensors: &mut dyn LineSensors,
    mut cards: Option<CardAnnouncer<'_>>,
    config: &BehaviorConfig,
    check_obstacle: bool,
    mut keep_going: impl FnMut() -> bool,
) -> Result<BehaviorEnd, BehaviorError> {
    let abort = motion.abort_signal();

    while keep_going() {
        if abort.is_raised() {
            return aborted(motion).await;
        }

        let left = sensors.read_left()?;
        let right = sensors.read_right()?;
        let obstacle = if check_obstacle {
            Some(sensors.read_obstacle()?)
        } else {
            None
        };

        let step = line_step(left, right, obstacle, config);
        if step == LineStep::Obstacle {
            info!("Obstacle ahead, leaving line following");
            motion.stop().await?;
            return Ok(BehaviorEnd::ObstacleAhead);
        }

        if let Some(cards) = cards.as_mut() {
            if !cards.announce(motion, config).await? {
                return aborted(motion).await;
            }
        }

        match step {
            LineStep::Drive(cmd) => motion.set_wheels(cmd).await?,
            LineStep::Keep => debug!("Line lost (l={} r={})", left, right),
            LineStep::Obstacle => {}
        }

        if !tick(&abort, config.line_tick()).await {
            return aborted(motion).await;
        }
    }

    motion.set_wheels(WheelCommand::zero()).await?;
    Ok(BehaviorEnd::TrackFinished)
}

/// Follow a line until an obstacle comes close, stopping to play the track
/// of every card passed on the way
pub async fn follow_line<M: MotionPrimitives>(
    motion: &mut M,
    sensors: &mut dyn LineSensors,
    cards: CardAnnouncer<'_>,
    display: &mut dyn Display,
    config: &BehaviorConfig,
) -> Result<BehaviorEnd, BehaviorError> {
    info!("Line following");
    display.set_emotion(&config.default_emotion);
    follow_line_while(motion, sensors, Some(cards), config, true, || true).await
}

/// Cruise forward, spinning away whenever something is close. Runs until
/// aborted.
pub async fn avoid_obstacles<M: MotionPrimitives>(
    motion: &mut M,
    sensors: &mut dyn LineSensors,
    display: &mut dyn Display,
    config: &BehaviorConfig,
) -> Result<BehaviorEnd, BehaviorError> {
    info!("Obstacle avoidance");
    display.set_emotion(&config.default_emotion);
    let abort = motion.abort_signal();

    loop {
        if abort.is_raised() {
            return aborted(motion).await;
        }

        let cmd = if sensors.read_obstacle()? < config.obstacle_threshold {
            debug!("Obstacle close, spinning away");
            WheelCommand::new(-100, 100)
        } else {
            WheelCommand::new(70, 70)
        };
        motion.set_wheels(cmd).await?;

        if !tick(&abort, config.avoid_tick()).await {
            return aborted(motion).await;
        }
    }
}

/// Play the dance track and repeat the routine while it plays
pub async fn dance<M: MotionPrimitives>(
    motion: &mut M,
    audio: &mut dyn AudioPlayer,
    display: &mut dyn Display,
    config: &BehaviorConfig,
) -> Result<BehaviorEnd, BehaviorError> {
    info!("Dancing to {}", config.dance_track);
    display.set_emotion(&config.default_emotion);
    audio.play(&config.dance_track)?;
    let abort = motion.abort_signal();

    while audio.is_playing() {
        for (left, right, hold_ms) in DANCE_ROUTINE {
            motion.set_wheels(WheelCommand::new(left, right)).await?;
            if !tick(&abort, Duration::from_millis(hold_ms)).await {
                audio.stop();
                return aborted(motion).await;
            }
        }
        motion.stop().await?;
    }

    info!("Dance finished");
    Ok(BehaviorEnd::TrackFinished)
}

/// Play `{role}.wav` and follow the line until it ends.
///
/// A role starting with `9` also names the emotion to show; the prefix is
/// dropped from the track name.
pub async fn learn<M: MotionPrimitives>(
    motion: &mut M,
    sensors: &mut dyn LineSensors,
    audio: &mut dyn AudioPlayer,
    display: &mut dyn Display,
    role: &str,
    config: &BehaviorConfig,
) -> Result<BehaviorEnd, BehaviorError> {
    let (emotion, role) = match role.strip_prefix('9') {
        Some(stripped) => (stripped, stripped),
        None => (config.default_emotion.as_str(), role),
    };
    info!("Learning '{}' ({})", role, emotion);
    display.set_emotion(emotion);

    let track = format!("{}.wav", role);
    if let Err(e) = audio.play(&track) {
        warn!("Cannot play {}: {}", track, e);
        return Err(e.into());
    }

    let audio = &*audio;
    follow_line_while(motion, sensors, None, config, false, || audio.is_playing()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::motion::testing::{Call, RecordingMotion};
    use crate::motion::{abort_pair, AbortSignal};
    use crate::sim::SimWorld;
    use tokio::time::Instant;

    fn config() -> BehaviorConfig {
        BehaviorConfig::default()
    }

    #[test]
    fn test_line_step_table() {
        let config = config();
        assert_eq!(line_step(100, 100, Some(4000), &config), LineStep::Drive(WheelCommand::new(35, 35)));
        assert_eq!(line_step(3000, 100, Some(4000), &config), LineStep::Drive(WheelCommand::new(20, 80)));
        assert_eq!(line_step(100, 3000, Some(4000), &config), LineStep::Drive(WheelCommand::new(80, 20)));
        assert_eq!(line_step(3000, 3000, Some(4000), &config), LineStep::Keep);
        assert_eq!(line_step(100, 100, Some(1500), &config), LineStep::Obstacle);
        assert_eq!(line_step(100, 100, None, &config), LineStep::Drive(WheelCommand::new(35, 35)));
    }

    #[test]
    fn test_thresholds_differ_per_side() {
        // 1000 is on the line for the left sensor but not for the right one
        let config = config();
        assert_eq!(line_step(1000, 1000, None, &config), LineStep::Drive(WheelCommand::new(80, 20)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_line_stops_at_obstacle() {
        let world = SimWorld::new(SimConfig::default());
        world.set_line(100, 100);
        world.push_obstacle(&[4000, 4000, 4000, 1000]);
        let mut motion = RecordingMotion::new(AbortSignal::never());
        let mut reader = world.card_reader();
        let mut audio = world.audio();
        let cards = CardAnnouncer {
            reader: &mut reader,
            audio: &mut audio,
        };

        let end = follow_line(&mut motion, &mut world.line_sensors(), cards, &mut world.display(), &config())
            .await
            .unwrap();

        assert_eq!(end, BehaviorEnd::ObstacleAhead);
        assert_eq!(
            motion.calls,
            vec![
                Call::Wheels(WheelCommand::new(35, 35)),
                Call::Wheels(WheelCommand::new(35, 35)),
                Call::Wheels(WheelCommand::new(35, 35)),
                Call::Stop,
            ]
        );
        assert_eq!(world.emotions(), vec!["NEUTRAL".to_string()]);
        assert!(world.tracks().is_empty());
    }

    #[test]
    fn test_card_track_name() {
        assert_eq!(CardUid(vec![0xDE, 0xAD, 0x0B, 0xEF]).track(), "DEAD0BEF.wav");
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_line_stops_for_card() {
        let world = SimWorld::new(SimConfig::default());
        world.set_line(100, 100);
        world.push_obstacle(&[4000, 4000, 1000]);
        world.place_card(&[0x12, 0x34, 0x56, 0x78]);
        let mut motion = RecordingMotion::new(AbortSignal::never());
        let mut reader = world.card_reader();
        let mut audio = world.audio();
        let cards = CardAnnouncer {
            reader: &mut reader,
            audio: &mut audio,
        };
        let start = Instant::now();

        let end = follow_line(&mut motion, &mut world.line_sensors(), cards, &mut world.display(), &config())
            .await
            .unwrap();

        assert_eq!(end, BehaviorEnd::ObstacleAhead);
        assert_eq!(world.tracks(), vec!["12345678.wav".to_string()]);
        // Stopped for the whole track, then carried on along the line
        assert!(start.elapsed() >= Duration::from_millis(3050));
        assert_eq!(
            motion.calls,
            vec![
                Call::Stop,
                Call::Wheels(WheelCommand::zero()),
                Call::Wheels(WheelCommand::new(35, 35)),
                Call::Wheels(WheelCommand::new(35, 35)),
                Call::Stop,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_while_card_track_plays() {
        let world = SimWorld::new(SimConfig::default());
        world.set_line(100, 100);
        world.place_card(&[0x01]);
        let (handle, signal) = abort_pair();
        let mut motion = RecordingMotion::new(signal);
        let mut sensors = world.line_sensors();
        let mut display = world.display();
        let mut reader = world.card_reader();
        let mut audio = world.audio();
        let cards = CardAnnouncer {
            reader: &mut reader,
            audio: &mut audio,
        };
        let config = config();

        let (end, _) = tokio::join!(
            follow_line(&mut motion, &mut sensors, cards, &mut display, &config),
            async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                handle.abort();
            }
        );

        assert_eq!(end.unwrap(), BehaviorEnd::Aborted);
        assert!(!world.audio().is_playing());
        assert_eq!(motion.calls, vec![Call::Stop, Call::Wheels(WheelCommand::zero())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_avoid_runs_until_aborted() {
        let world = SimWorld::new(SimConfig::default());
        world.push_obstacle(&[4000, 1000, 4000]);
        let (handle, signal) = abort_pair();
        let mut motion = RecordingMotion::new(signal);
        let mut sensors = world.line_sensors();
        let mut display = world.display();
        let config = config();

        let (end, _) = tokio::join!(
            avoid_obstacles(&mut motion, &mut sensors, &mut display, &config),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                handle.abort();
            }
        );

        assert_eq!(end.unwrap(), BehaviorEnd::Aborted);
        assert_eq!(motion.calls[0], Call::Wheels(WheelCommand::new(70, 70)));
        assert_eq!(motion.calls[1], Call::Wheels(WheelCommand::new(-100, 100)));
        assert_eq!(motion.calls[2], Call::Wheels(WheelCommand::new(70, 70)));
        assert_eq!(motion.calls.last(), Some(&Call::Wheels(WheelCommand::zero())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dance_repeats_while_track_plays() {
        let world = SimWorld::new(SimConfig {
            track_length_ms: 7000,
            ..Default::default()
        });
        let mut motion = RecordingMotion::new(AbortSignal::never());
        let start = Instant::now();

        let end = dance(&mut motion, &mut world.audio(), &mut world.display(), &config())
            .await
            .unwrap();

        assert_eq!(end, BehaviorEnd::TrackFinished);
        assert_eq!(world.tracks(), vec!["BABYSHARK.wav".to_string()]);
        // Two full routines: the track is still playing after the first
        let stops = motion.calls.iter().filter(|call| **call == Call::Stop).count();
        assert_eq!(stops, 2);
        assert!(start.elapsed() >= Duration::from_millis(11000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_learn_with_emotion_prefix() {
        let world = SimWorld::new(SimConfig::default());
        world.set_line(100, 3000);
        let mut motion = RecordingMotion::new(AbortSignal::never());
        let start = Instant::now();

        let end = learn(
            &mut motion,
            &mut world.line_sensors(),
            &mut world.audio(),
            &mut world.display(),
            "9HAPPY",
            &config(),
        )
        .await
        .unwrap();

        assert_eq!(end, BehaviorEnd::TrackFinished);
        assert_eq!(world.emotions(), vec!["HAPPY".to_string()]);
        assert_eq!(world.tracks(), vec!["HAPPY.wav".to_string()]);
        assert!(start.elapsed() >= Duration::from_millis(3000));
        assert_eq!(motion.calls[0], Call::Wheels(WheelCommand::new(80, 20)));
        assert_eq!(motion.calls.last(), Some(&Call::Wheels(WheelCommand::zero())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_learn_plain_role_uses_default_emotion() {
        let world = SimWorld::new(SimConfig {
            track_length_ms: 200,
            ..Default::default()
        });
        let mut motion = RecordingMotion::new(AbortSignal::never());

        learn(
            &mut motion,
            &mut world.line_sensors(),
            &mut world.audio(),
            &mut world.display(),
            "doctor",
            &config(),
        )
        .await
        .unwrap();

        assert_eq!(world.emotions(), vec!["NEUTRAL".to_string()]);
        assert_eq!(world.tracks(), vec!["doctor.wav".to_string()]);
    }
}
