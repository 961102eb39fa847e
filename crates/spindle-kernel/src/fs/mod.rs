pub mod block;
pub mod cache;
mod lru;
