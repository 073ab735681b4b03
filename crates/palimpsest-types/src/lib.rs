pub mod event;
pub mod message;
pub mod result;
pub mod snapshot;

pub use event::*;
pub use message::*;
pub use result::*;
pub use snapshot::*;
