pub mod envelope;
pub mod error;
pub mod event;
pub mod plan;

pub use envelope::*;
pub use error::*;
pub use event::*;
pub use plan::*;

pub const PROTOCOL_VERSION: &str = "1.0.0";
