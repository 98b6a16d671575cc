pub mod device;
pub mod embedder;
pub mod generator;
