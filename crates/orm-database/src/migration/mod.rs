pub mod cli;
pub mod runner;
pub mod types;

pub use cli::*;
pub use runner::*;
pub use types::*;
