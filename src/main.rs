use swarm_secrets_smoke::cli::run_cli;

#[tokio::main]
async fn main() {
    // Load .env file if it exists (optional - won't fail if missing)
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let code = match run_cli().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            swarm_secrets_smoke::session::EXIT_FAILURE
        }
    };
    std::process::exit(code);
}
