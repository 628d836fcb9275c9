pub mod discover;
pub mod interfaces;
pub mod listen;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sweepr")]
#[command(about = "Finds devices on the local network over mDNS.")]
pub struct CommandLine {
    /// Increase log output (-v debug, -vv packet dumps)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List active interfaces and the subnets a sweep would cover
    #[command(alias = "i")]
    Interfaces,
    /// Print every mDNS answer seen on the network
    #[command(alias = "l")]
    Listen {
        /// How long to listen for
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
    /// Query mDNS services and report the devices that answer
    #[command(alias = "d")]
    Discover(discover::DiscoverArgs),
}

impl CommandLine {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
