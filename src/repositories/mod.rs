pub(crate) mod health;
pub(crate) mod jobs;
pub(crate) mod security;
pub(crate) mod store;
pub(crate) mod submissions;
