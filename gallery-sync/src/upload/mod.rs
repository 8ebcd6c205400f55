pub mod compress;
pub mod queue;
pub mod transport;
pub mod validate;
