pub mod catalog;
pub mod collector;
pub mod config;
pub mod distributed;
pub mod executors;
pub mod observe;
pub mod protocol;
pub mod sync;
