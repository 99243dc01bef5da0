use clap::Parser;

#[tokio::main]
async fn main() {
    let args = agentrun::cli::Args::parse();
    match agentrun::cli::run(args).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("agentrun: {}", err);
            std::process::exit(1);
        }
    }
}
