pub mod engine;
pub mod store;
pub mod cli;
pub mod utils;

pub use engine::*;
pub use store::*;
pub use cli::*;
pub use utils::*;
