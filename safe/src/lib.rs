pub mod callgraph;
pub mod correlate;
pub mod elf;
pub mod lsda;
pub mod pipeline;
pub mod rtti;
pub mod utilities;

pub use utilities::FromByteStream;
