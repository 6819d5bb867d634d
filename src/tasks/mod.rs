pub(crate) mod learning;
pub(crate) mod scheduler;
