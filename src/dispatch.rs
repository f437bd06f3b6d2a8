// Command dispatcher
//
// Tokens arrive one at a time from the controller. `0`-`4` switch mode in
// every mode; everything else is interpreted by the current mode.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::behavior::{self, AudioPlayer, BehaviorEnd, BehaviorError, CardAnnouncer, CardReader, Display, LineSensors};
use crate::config::{BehaviorConfig, DispatchConfig};
use crate::motion::{Direction, MotionError, MotionPrimitives, MotionRequest};
use crate::motor::WheelCommand;

const PROGRAM_END: &str = "END";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Only mode tokens are accepted
    Waiting,
    Program,
    Control,
    Learn,
    Ai,
    Behaviors,
}

impl Mode {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "0" => Some(Mode::Program),
            "1" => Some(Mode::Control),
            "2" => Some(Mode::Learn),
            "3" => Some(Mode::Ai),
            "4" => Some(Mode::Behaviors),
            _ => None,
        }
    }
}

/// Result of one `handle_command` call
#[derive(Debug)]
pub enum DispatchOutcome {
    ModeChanged(Mode),
    /// Step added to the program; carries the queue length
    Queued(usize),
    /// Motion (or a whole program) ran to completion
    Completed { steps: usize },
    Behavior(BehaviorEnd),
    Ignored,
    /// The robot was left stopped; the error is reported, never propagated
    Failed(BehaviorError),
}

/// Peripherals the behaviours need besides the motion backend
pub struct Companions {
    pub sensors: Box<dyn LineSensors>,
    pub cards: Box<dyn CardReader>,
    pub audio: Box<dyn AudioPlayer>,
    pub display: Box<dyn Display>,
}

pub struct CommandDispatcher<M: MotionPrimitives> {
    motion: M,
    companions: Companions,
    config: DispatchConfig,
    behavior: BehaviorConfig,
    mode: Mode,
    program: Vec<MotionRequest>,
}

impl<M: MotionPrimitives> CommandDispatcher<M> {
    pub fn new(motion: M, companions: Companions, config: DispatchConfig, behavior: BehaviorConfig) -> Self {
        Self {
            motion,
            companions,
            config,
            behavior,
            mode: Mode::Waiting,
            program: Vec::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Steps waiting for `END`
    pub fn program(&self) -> &[MotionRequest] {
        &self.program
    }

    pub fn motion(&self) -> &M {
        &self.motion
    }

    pub fn motion_mut(&mut self) -> &mut M {
        &mut self.motion
    }

    /// Interpret one token. Motion runs to completion before this returns.
    pub async fn handle_command(&mut self, token: &str) -> DispatchOutcome {
        let token = token.trim();

        if let Some(mode) = Mode::from_token(token) {
            info!("Mode {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
            self.program.clear();
            return DispatchOutcome::ModeChanged(mode);
        }

        match self.mode {
            Mode::Waiting => {
                debug!("Waiting for a mode, ignoring '{}'", token);
                DispatchOutcome::Ignored
            }
            Mode::Program => self.program_token(token).await,
            Mode::Control => self.control_token(token).await,
            Mode::Learn => self.learn_token(token).await,
            Mode::Ai => {
                info!("AI mode is not supported, ignoring '{}'", token);
                DispatchOutcome::Ignored
            }
            Mode::Behaviors => self.behavior_token(token).await,
        }
    }

    fn step_request(&self, token: &str) -> Option<MotionRequest> {
        let turn = self.motion.motion_config().default_turn_deg;
        match token {
            "f" => Some(MotionRequest::Forward { steps: Some(1) }),
            "b" => Some(MotionRequest::Backward { steps: Some(1) }),
            "l" => Some(MotionRequest::TurnLeft { angle: Some(turn) }),
            "r" => Some(MotionRequest::TurnRight { angle: Some(turn) }),
            _ => None,
        }
    }

    async fn program_token(&mut self, token: &str) -> DispatchOutcome {
        if token == PROGRAM_END {
            return self.run_program().await;
        }

        match self.step_request(token) {
            Some(request) => {
                self.program.push(request);
                debug!("Queued {:?} ({} steps)", request, self.program.len());
                DispatchOutcome::Queued(self.program.len())
            }
            None => {
                warn!("Unknown program token '{}'", token);
                DispatchOutcome::Ignored
            }
        }
    }

    async fn run_program(&mut self) -> DispatchOutcome {
        let program = std::mem::take(&mut self.program);
        info!("Running program: {} steps", program.len());
        let abort = self.motion.abort_signal();

        for (i, request) in program.iter().enumerate() {
            info!("Step {}/{}: {:?}", i + 1, program.len(), request);
            match self.motion.execute(*request).await {
                Ok(_) => {}
                Err(MotionError::Timeout { .. }) => warn!("Step {} timed out, continuing", i + 1),
                Err(e) => return self.fail(e.into()).await,
            }

            if let Err(e) = abort.sleep(self.config.program_step_pause()).await {
                return self.fail(e.into()).await;
            }
        }

        // A card left under the robot at the end of the program is announced
        let Companions { cards, audio, .. } = &mut self.companions;
        let mut announcer = CardAnnouncer {
            reader: cards.as_mut(),
            audio: audio.as_mut(),
        };
        let announced = announcer.announce(&mut self.motion, &self.behavior).await;
        match announced {
            Ok(true) => DispatchOutcome::Completed { steps: program.len() },
            Ok(false) => self.fail(MotionError::Aborted.into()).await,
            Err(e) => self.fail(e).await,
        }
    }

    async fn control_token(&mut self, token: &str) -> DispatchOutcome {
        let request = match token {
            "f" => MotionRequest::ManualDrive(Direction::Forward),
            "b" => MotionRequest::ManualDrive(Direction::Backward),
            "l" => MotionRequest::ManualDrive(Direction::Left),
            "r" => MotionRequest::ManualDrive(Direction::Right),
            "s" => MotionRequest::Stop,
            _ => {
                warn!("Invalid control token '{}'", token);
                return DispatchOutcome::Ignored;
            }
        };

        let result = self.motion.execute(request).await;
        tokio::time::sleep(self.config.control_settle()).await;
        match result {
            Ok(_) => DispatchOutcome::Completed { steps: 1 },
            Err(e) => self.fail(e.into()).await,
        }
    }

    async fn learn_token(&mut self, token: &str) -> DispatchOutcome {
        if token.is_empty() {
            return DispatchOutcome::Ignored;
        }
        let Companions {
            sensors,
            audio,
            display,
            ..
        } = &mut self.companions;
        let result = behavior::learn(
            &mut self.motion,
            sensors.as_mut(),
            audio.as_mut(),
            display.as_mut(),
            token,
            &self.behavior,
        )
        .await;
        self.behavior_result(result).await
    }

    async fn behavior_token(&mut self, token: &str) -> DispatchOutcome {
        let Companions {
            sensors,
            cards,
            audio,
            display,
        } = &mut self.companions;
        let result = match token {
            "LINE" => {
                let announcer = CardAnnouncer {
                    reader: cards.as_mut(),
                    audio: audio.as_mut(),
                };
                behavior::follow_line(&mut self.motion, sensors.as_mut(), announcer, display.as_mut(), &self.behavior)
                    .await
            }
            "AVOID" => {
                behavior::avoid_obstacles(&mut self.motion, sensors.as_mut(), display.as_mut(), &self.behavior)
                    .await
            }
            "DANCE" => behavior::dance(&mut self.motion, audio.as_mut(), display.as_mut(), &self.behavior).await,
            _ => {
                warn!("Unknown behaviour '{}'", token);
                return DispatchOutcome::Ignored;
            }
        };
        self.behavior_result(result).await
    }

    async fn behavior_result(&mut self, result: Result<BehaviorEnd, BehaviorError>) -> DispatchOutcome {
        match result {
            Ok(end) => DispatchOutcome::Behavior(end),
            Err(e) => self.fail(e).await,
        }
    }

    /// Leave the motors neutral and report the error
    async fn fail(&mut self, err: BehaviorError) -> DispatchOutcome {
        warn!("Command failed: {}", err);
        if let Err(e) = self.motion.set_wheels(WheelCommand::zero()).await {
            warn!("Failed to release the wheels: {}", e);
        }
        DispatchOutcome::Failed(err)
    }
}
