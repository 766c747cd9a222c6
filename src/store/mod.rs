//! Storage module for device identity and pairing data.

mod device;
mod memory;
mod sqlite;
mod traits;

pub use device::*;
pub use memory::*;
pub use sqlite::*;
pub use traits::*;
