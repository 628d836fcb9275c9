pub mod dns;
pub mod mdns;
