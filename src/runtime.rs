// 50 Hz transport loop in front of the command dispatcher
//
// Two futures share one task: the pump drains zenoh into a token queue and
// publishes acks and state, the motion loop runs one command at a time.
// A stop or mode token raises the abort signal when it has something to
// cancel: a running command or tokens queued ahead of it. The signal stays
// raised until the motion loop reaches the token that raised it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::{RobotConfig, COMMAND_QUEUE_DEPTH, LOOP_HZ, TOPIC_ACK, TOPIC_CMD, TOPIC_STATE};
use crate::dispatch::{CommandDispatcher, Mode};
use crate::messages::{CommandAck, CommandMessage, MotionState};
use crate::motion::{abort_pair, AbortHandle, MotionPrimitives};
use crate::sim::SimWorld;

const STOP_TOKEN: &str = "s";

/// Stop and mode tokens cancel whatever runs or waits ahead of them
pub fn is_interrupt(token: &str) -> bool {
    let token = token.trim();
    token == STOP_TOKEN || Mode::from_token(token).is_some()
}

/// Queue position of the latest interrupting token (1-based, 0 = none)
#[derive(Clone, Default)]
pub struct InterruptMark(Arc<AtomicU64>);

impl InterruptMark {
    fn set(&self, seq: u64) {
        self.0.store(seq, Ordering::Release);
    }

    /// Has the token at queue position `seq` caught up with the mark
    pub fn reached(&self, seq: u64) -> bool {
        seq >= self.0.load(Ordering::Acquire)
    }
}

/// Transport-side half: forwards tokens and decides when to abort
pub struct Runtime {
    token_tx: mpsc::Sender<String>,
    abort: AbortHandle,
    state: watch::Receiver<MotionState>,
    mark: InterruptMark,
    sent: u64,
}

impl Runtime {
    pub fn new(token_tx: mpsc::Sender<String>, abort: AbortHandle, state: watch::Receiver<MotionState>) -> Self {
        Self {
            token_tx,
            abort,
            state,
            mark: InterruptMark::default(),
            sent: 0,
        }
    }

    /// Shared with the motion loop
    pub fn interrupt_mark(&self) -> InterruptMark {
        self.mark.clone()
    }

    /// Process one raw payload from the command topic
    pub fn on_payload(&mut self, payload: &[u8]) {
        match serde_json::from_slice::<CommandMessage>(payload) {
            Ok(msg) => self.on_command(msg),
            Err(e) => warn!("Failed to parse command: {}", e),
        }
    }

    fn on_command(&mut self, msg: CommandMessage) {
        info!("Received command: {:?}", msg.token);
        let interrupts = is_interrupt(&msg.token);
        let queued = self.token_tx.max_capacity() - self.token_tx.capacity();
        let busy = self.state.borrow().busy;

        if let Err(e) = self.token_tx.try_send(msg.token) {
            warn!("Dropping command: {}", e);
            return;
        }
        self.sent += 1;

        if interrupts && (busy || queued > 0) {
            warn!("Interrupt with {} queued (busy: {}), aborting", queued, busy);
            self.mark.set(self.sent);
            self.abort.abort();
        }
    }

    pub fn state(&self) -> MotionState {
        self.state.borrow().clone()
    }
}

/// Execute tokens in arrival order until the queue closes
pub async fn motion_loop<M: MotionPrimitives>(
    mut dispatcher: CommandDispatcher<M>,
    mut tokens: mpsc::Receiver<String>,
    acks: mpsc::Sender<CommandAck>,
    state: watch::Sender<MotionState>,
    abort: AbortHandle,
    mark: InterruptMark,
) {
    let mut received = 0u64;
    while let Some(token) = tokens.recv().await {
        received += 1;
        if mark.reached(received) {
            abort.clear();
        }
        state.send_modify(|s| {
            s.busy = true;
            s.last_token = Some(token.clone());
        });

        let outcome = dispatcher.handle_command(&token).await;
        let mode = dispatcher.mode();
        state.send_modify(|s| {
            s.busy = false;
            s.mode = mode;
            s.handled += 1;
        });

        if acks.send(CommandAck::new(token, mode, &outcome)).await.is_err() {
            break;
        }
    }
    info!("Motion loop stopped");
}

/// Run the simulated robot behind the zenoh command topics
pub async fn run(config: RobotConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD).await?;
    let pub_ack = session.declare_publisher(TOPIC_ACK).await?;
    let pub_state = session.declare_publisher(TOPIC_STATE).await?;

    let (abort, signal) = abort_pair();
    let world = SimWorld::new(config.sim.clone());
    let dispatcher = world.dispatcher(&config, signal)?;

    let (token_tx, token_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (ack_tx, mut ack_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let (state_tx, state_rx) = watch::channel(MotionState::default());
    let mut runtime = Runtime::new(token_tx, abort.clone(), state_rx);
    let mark = runtime.interrupt_mark();

    info!("Runtime started: {}Hz loop", LOOP_HZ);
    info!("Subscribed to: {}", TOPIC_CMD);
    info!("Publishing to: {}, {}", TOPIC_ACK, TOPIC_STATE);

    let pump = async {
        let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
        'pump: loop {
            tick.tick().await;

            // 1. Drain all pending commands (non-blocking)
            while let Ok(Some(sample)) = subscriber.try_recv() {
                let payload = sample.payload().to_bytes();
                runtime.on_payload(&payload);
            }

            // 2. Publish acknowledgements
            loop {
                match ack_rx.try_recv() {
                    Ok(ack) => pub_ack.put(serde_json::to_string(&ack)?).await?,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => break 'pump,
                }
            }

            // 3. Publish state
            let state_json = serde_json::to_string(&runtime.state())?;
            pub_state.put(state_json).await?;
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    };

    let motion = motion_loop(dispatcher, token_rx, ack_tx, state_tx, abort, mark);

    tokio::select! {
        result = pump => result,
        _ = motion => Ok(()),
    }
}
