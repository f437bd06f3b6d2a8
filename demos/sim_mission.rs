// Sim mission: run a token script against the simulated robot, no transport
//
// Usage: cargo run --example sim_mission -- [tokens...]
// Example: cargo run --example sim_mission -- 0 f f l END
//
// Without arguments a short program is run. Set RUST_LOG=debug to watch the
// control loops.

use tokio::time::Instant;
use toybot_motion::config::RobotConfig;
use toybot_motion::messages::CommandAck;
use toybot_motion::motion::AbortSignal;
use toybot_motion::sim::SimWorld;
use tracing::info;

const DEFAULT_SCRIPT: [&str; 6] = ["0", "f", "r", "f", "l", "END"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let mut script: Vec<String> = std::env::args().skip(1).collect();
    if script.is_empty() {
        script = DEFAULT_SCRIPT.iter().map(|t| t.to_string()).collect();
    }

    let config = RobotConfig::default();
    let world = SimWorld::new(config.sim.clone());
    let mut dispatcher = world.dispatcher(&config, AbortSignal::never())?;

    println!("Script: {}", script.join(" "));
    println!();

    for token in &script {
        let start = Instant::now();
        let outcome = dispatcher.handle_command(token).await;
        let ack = CommandAck::new(token.as_str(), dispatcher.mode(), &outcome);
        println!(
            "{:>6}  {:<12} {:?}  ({:.2}s){}",
            token,
            format!("{:?}", ack.mode),
            ack.status,
            start.elapsed().as_secs_f32(),
            ack.detail.map(|d| format!("  {}", d)).unwrap_or_default()
        );
    }

    let yaw = dispatcher.motion().estimator().normalized_signed();
    info!("Final yaw since last calibration: {:.2} deg", yaw);
    println!();
    println!("Wheels coasting: {}", world.is_coasting());
    Ok(())
}
