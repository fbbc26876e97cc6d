pub mod config;
pub mod errors;
pub mod types;

pub use config::ClientConfig;
pub use errors::{ConfigError, FrameError, SignalingError};
pub use types::*;
