use tickwatch::{App, Config};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    let mut app = match App::build(config).await {
        Ok(app) => app,
        Err(e) => {
            log::error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app.start().await {
        log::error!("startup failed: {}", e);
        std::process::exit(1);
    }
    log::info!("tickwatch up");

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("signal handler failed: {}", e);
    }
    app.shutdown().await;
}
