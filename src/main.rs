use std::path::PathBuf;

use clap::Parser;
use toybot_motion::config::RobotConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Toy robot motion runtime on a simulated body")]
struct Args {
    /// JSON config file; missing fields use defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the simulated gyro Z bias (deg/s)
    #[arg(long)]
    gyro_bias: Option<f32>,

    /// Simulate wheels that spin without turning the robot
    #[arg(long)]
    stalled: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => match RobotConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Config error ({}): {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => RobotConfig::default(),
    };
    if let Some(bias) = args.gyro_bias {
        config.sim.gyro_bias_dps = bias;
    }
    config.sim.stalled |= args.stalled;

    if let Err(e) = toybot_motion::runtime::run(config).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
