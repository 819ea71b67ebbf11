mod file;
mod memory;

pub use file::FilePartition;
pub use memory::MemoryPartition;
