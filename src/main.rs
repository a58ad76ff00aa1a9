use burrow::{Config, Supervisor};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let config = match Config::load_default() {
        Ok(config) => config,
        Err(e) => {
            // Logging isn't set up yet without a parsed config, so this
            // one line has to stand on its own.
            eprintln!("failed to load config.yaml: {e:#}");
            std::process::exit(1);
        }
    };

    init_logging(&config.log_filter);

    let supervisor = Supervisor::new(config);
    if let Err(e) = supervisor.run().await {
        tracing::error!(error = %e, "tunnel exited with a fatal error");
        std::process::exit(1);
    }
}

fn init_logging(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
