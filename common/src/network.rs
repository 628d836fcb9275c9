pub mod interface;
pub mod port;
pub mod range;
