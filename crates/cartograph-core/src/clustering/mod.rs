pub mod engine;
pub mod oracle;
pub mod reconcile;
pub mod tree;
