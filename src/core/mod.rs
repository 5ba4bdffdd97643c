pub mod column;
pub mod engine;
pub mod tables;
