//! Wire and data types shared across the crate.

mod claims;
mod device;
mod invocation;
mod jwks;
mod tools;

pub use claims::*;
pub use device::*;
pub use invocation::*;
pub use jwks::*;
pub use tools::*;
