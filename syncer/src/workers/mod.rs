pub mod policy;
pub mod queue;
