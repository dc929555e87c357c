pub mod process;
pub mod worker;
