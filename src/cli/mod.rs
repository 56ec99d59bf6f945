//! Command line front end: argument parsing and the simulation runner.

pub mod args;
pub mod simulate;

pub use args::{Args, Commands, SimulateArgs};
pub use simulate::{SimulationSummary, run_simulation, square_region};
