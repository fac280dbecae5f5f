pub mod diagnostics;
pub mod execute;
pub mod health;

pub use diagnostics::*;
pub use execute::*;
pub use health::*;
