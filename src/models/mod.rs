pub mod diagnostics;
pub mod error;
pub mod execution;
pub mod health;
pub mod identity;
pub mod messages;

pub use diagnostics::*;
pub use error::*;
pub use execution::*;
pub use health::*;
pub use identity::*;
pub use messages::*;
