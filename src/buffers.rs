pub mod chunk_pool;
pub mod circular_buffer;
pub mod object_pool;
