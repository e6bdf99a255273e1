pub mod cli;
pub mod listener;
pub mod loader;
