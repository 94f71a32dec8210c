pub mod config;
pub mod error;
pub mod panic;

pub use config::{load_dotenv, ManagerConfig, TaskmillConfig, WatchdogConfig};
pub use error::*;
pub use panic::panic_message;
