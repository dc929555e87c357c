pub mod coordinator;
pub mod dispatcher;
pub mod task;
