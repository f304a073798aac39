pub mod config;
pub mod naming;
pub mod paths;
pub mod prompt;
pub mod stream;
pub mod types;

pub use config::Config;
pub use paths::Paths;
pub use types::*;
