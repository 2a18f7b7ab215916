pub mod call;
pub mod config;
pub mod messages;

pub use call::*;
pub use config::*;
pub use messages::*;
