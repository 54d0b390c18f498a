// crates/core/src/lib.rs
pub mod config;
pub mod error;
pub mod fact;
pub mod keys;
pub mod paths;
pub mod ratio;
pub mod stats;
pub mod style;
pub mod time;

pub use config::*;
pub use error::*;
pub use fact::*;
pub use keys::*;
pub use ratio::*;
pub use stats::*;
pub use style::*;
pub use time::*;
