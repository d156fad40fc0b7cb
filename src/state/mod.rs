pub mod buckets;
pub mod result;
pub mod session;
pub mod stats;

pub use buckets::*;
pub use result::*;
pub use session::*;
pub use stats::*;
