mod attribute;
mod device;
mod migration;
mod result;
mod tenant;

pub use attribute::*;
pub use device::*;
pub use migration::*;
pub use result::*;
pub use tenant::*;
