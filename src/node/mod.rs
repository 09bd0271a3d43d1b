pub mod node_config;
pub mod node;
