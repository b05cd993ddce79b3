pub mod analysis;
pub mod builder;

pub use builder::DependencyGraph;
