//! CLI command implementations

pub mod convert;
pub mod inspect;

pub use convert::ConvertCommand;
pub use inspect::InspectCommand;
