mod cli;

use clap::Parser;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = cli::CLI::parse();
    cli.run().await
}
