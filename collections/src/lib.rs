pub mod lru;
pub mod spsc;
