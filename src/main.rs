mod app;
mod config;
mod credentials;
mod events;
mod llm;
mod memory;
mod model;
mod pipeline;
mod prompt;
mod server;
mod supervisor;
mod transport;

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = app::run().await {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}
