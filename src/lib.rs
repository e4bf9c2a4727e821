// src/lib.rs - Closed-loop temperature regulation for a nitrogen-cooled enclosure
pub mod communication;
pub mod config;
pub mod control;
pub mod control_loop;
pub mod hardware;
pub mod history;
pub mod sample;
pub mod sensors;
pub mod storage;

pub use config::{load_config, Config, ConfigError};
pub use control::{ControlMode, ControlStrategy, FeedbackMode, StrategyKind, ValveCommand};
pub use control_loop::{ControlError, ControlLoop, LoopStats, TickReport};
pub use sample::Sample;
