pub mod guard;
pub mod migrate;
pub mod tree;
