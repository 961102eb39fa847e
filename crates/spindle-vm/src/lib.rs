pub mod devices;
pub mod error;

pub use devices::*;
pub use error::*;
