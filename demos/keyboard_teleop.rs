// Keyboard teleop: 0-4 mode, WASD drive, SPACE stop, E end program, Q quit
//
// Publishes one token per key press on the command topic. In control mode a
// held key repeats; once no movement key has been seen for a while a stop
// token is sent so the robot does not keep driving.
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use serde_json::json;
use std::time::{Duration, Instant};
use toybot_motion::config::TOPIC_CMD;
use tracing::info;

const INPUT_TIMEOUT_MS: u64 = 300; // Send a stop after this much time with no movement key

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD).await?;

    info!("Controls: 0-4=mode, WASD=drive/queue, SPACE=stop, E=END, L/V/N=line/avoid/dance, Q=quit");

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn send(
    publisher: &zenoh::pubsub::Publisher<'_>,
    token: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cmd = json!({ "token": token });
    publisher.put(cmd.to_string()).await?;
    info!("Sent {}", token);
    Ok(())
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut last_movement_input: Option<Instant> = None;

    loop {
        // Poll for key with 20ms timeout
        if event::poll(Duration::from_millis(20))? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let pressed = kind == KeyEventKind::Press || kind == KeyEventKind::Repeat;

                let token = match code {
                    KeyCode::Char(c @ '0'..='4') if pressed => Some(c.to_string()),

                    // Movement
                    KeyCode::Char('w') if pressed => Some("f".to_string()),
                    KeyCode::Char('s') if pressed => Some("b".to_string()),
                    KeyCode::Char('a') if pressed => Some("l".to_string()),
                    KeyCode::Char('d') if pressed => Some("r".to_string()),
                    KeyCode::Char(' ') if pressed => Some("s".to_string()),

                    // Program and behaviours
                    KeyCode::Char('e') if pressed => Some("END".to_string()),
                    KeyCode::Char('l') if pressed => Some("LINE".to_string()),
                    KeyCode::Char('v') if pressed => Some("AVOID".to_string()),
                    KeyCode::Char('n') if pressed => Some("DANCE".to_string()),

                    // Quit
                    KeyCode::Char('q') | KeyCode::Esc if pressed => break,

                    _ => None,
                };

                if let Some(token) = token {
                    // Any other key cancels the pending release stop
                    last_movement_input = matches!(token.as_str(), "f" | "b" | "l" | "r")
                        .then(Instant::now);
                    send(publisher, &token).await?;
                }
            }
        }

        // Release: stop once movement keys have gone quiet
        if let Some(at) = last_movement_input {
            if at.elapsed() > Duration::from_millis(INPUT_TIMEOUT_MS) {
                send(publisher, "s").await?;
                last_movement_input = None;
            }
        }
    }

    Ok(())
}
