pub mod cache;
pub mod callgraph;
pub mod filesystem;
pub mod functions;
pub mod parser;
pub mod pipeline;
pub mod side_effects;
