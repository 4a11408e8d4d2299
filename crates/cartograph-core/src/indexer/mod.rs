pub mod leaves;
pub mod namespace;
pub mod pipeline;
pub mod resolver;
