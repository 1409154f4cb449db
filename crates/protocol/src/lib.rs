pub mod config;
pub mod messages;
pub mod proto;
pub mod sample;

pub use config::*;
pub use messages::*;
pub use sample::*;
