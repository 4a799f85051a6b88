pub mod cache;
pub mod db;
pub mod queue;

pub use cache::RedisLockCache;
pub use db::PgStore;
pub use queue::PgJobQueue;
