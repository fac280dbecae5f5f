pub mod orchestrator;
pub mod profiles;
pub mod provider;

pub use orchestrator::*;
pub use profiles::*;
pub use provider::*;
