pub mod icmp;
pub mod interface;
pub mod socket;
pub mod timestamp;

pub use icmp::*;
pub use interface::*;
pub use socket::*;
pub use timestamp::*;
