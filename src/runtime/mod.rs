pub mod net;
pub mod context;
pub mod storage;
pub mod redis_storage;
pub mod events;
pub mod id;
pub mod condition;
pub mod task;
pub mod join;
pub mod or_join;
pub mod workflow;
pub mod syscall;
pub mod engine;
