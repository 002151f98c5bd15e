pub mod memory;
pub mod redis;

pub use self::{memory::InMemoryRateLimitStore, redis::RedisRateLimitStore};
