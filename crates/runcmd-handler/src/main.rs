use clap::Parser;
use runcmd_handler::{init_tracing, run, Cli};

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = run(cli).await;
    std::process::exit(exit_code);
}
