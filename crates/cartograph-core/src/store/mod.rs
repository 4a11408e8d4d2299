pub mod persist;
pub mod validate;
