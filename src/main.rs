use chipflow::cli::Cli;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize logging
    cli.init_logging()?;

    // Execute command; workers and failed runs report through the exit code
    let code = cli.execute().await?;
    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}
