//! Generation sessions: the aggregate, its state machine and the services
//! that drive, observe and recover it.

pub mod aggregate;
pub mod error_handling;
pub mod events;
pub mod generator;
pub mod manager;
pub mod progress;
pub mod recovery;
pub mod state;
pub mod types;

#[cfg(test)]
mod tests;

pub use aggregate::*;
pub use error_handling::*;
pub use events::*;
pub use generator::*;
pub use manager::*;
pub use progress::*;
pub use recovery::*;
pub use state::*;
pub use types::*;
