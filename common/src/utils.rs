pub mod hex;
pub mod interface;
