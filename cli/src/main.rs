mod commands;
mod terminal;

use commands::{CommandLine, Commands, discover, interfaces, listen};
use terminal::{logging, print};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let commands = CommandLine::parse_args();

    logging::init_logging(commands.verbose);

    match commands.command {
        Commands::Interfaces => {
            print::header("network interfaces");
            interfaces::interfaces()
        }
        Commands::Listen { seconds } => {
            print::header("listening for mdns traffic");
            listen::listen(seconds).await
        }
        Commands::Discover(args) => {
            print::header("getting ready for discovery");
            discover::discover(args).await
        }
    }
}
