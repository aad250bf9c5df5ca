pub mod config;
pub mod error;
pub mod types;

pub use config::AffinityConfig;
pub use error::{AffinityError, EncodeError, Result};
pub use types::*;
