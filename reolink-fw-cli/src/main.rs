use anyhow::Result;

mod cache;
mod cli;
mod fetch;
mod input;
mod tracing_init;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    tracing_init::init(&cli.global)?;
    if let Err(e) = cli.run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
    Ok(())
}
