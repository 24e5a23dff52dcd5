pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ErrorKind, FlowError, Result};
pub use traits::{Publication, Sink, Unit};
pub use types::*;
