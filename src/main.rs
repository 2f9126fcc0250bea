mod api;
mod app;
mod config;
mod db;
mod error;
mod favorites;
mod models;
mod repository;

use app::{App, Command};
use config::Config;
use error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (only show warnings and errors by default)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = Command::parse(&args)?;

    if command == Command::Help {
        println!("{}", app::USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    let app = App::new(&config).await?;

    let mut stdout = std::io::stdout().lock();
    let result = app.run(command, &mut stdout).await;

    app.shutdown();
    result
}
