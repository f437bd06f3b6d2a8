pub mod behavior;
pub mod config;
pub mod dispatch;
pub mod imu;
pub mod messages;
pub mod motion;
pub mod motor;
pub mod runtime;
pub mod sim;
