pub mod listener;
pub mod pool;
