pub mod cli;
pub mod listener;
pub mod signals;
pub mod supervisor;
