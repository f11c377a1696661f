// Core engine components
pub mod expression;
pub mod query_planner;
pub mod query_executor;
pub mod materializer;
pub mod query_builder;
pub mod engine;

pub use expression::*;
pub use query_planner::*;
pub use query_executor::*;
pub use materializer::*;
pub use query_builder::*;
pub use engine::*;
