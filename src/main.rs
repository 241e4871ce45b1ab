use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = doorman::cli::Cli::parse();
    if let Err(e) = doorman::cmd::dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
