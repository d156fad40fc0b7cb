pub mod engine;
pub mod receiver;
pub mod reporter;

pub use engine::*;
pub use receiver::*;
pub use reporter::*;
