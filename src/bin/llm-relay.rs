use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use llm_relay::http::{router, AppState};
use llm_relay::{Config, Pool, Upstream};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config_path = "config.yaml".to_string();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-config" => {
                config_path = args.next().ok_or("missing value for --config")?;
            }
            "--help" | "-h" => {
                println!("usage: llm-relay [--config config.yaml]");
                return Ok(());
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let config = Config::load(&config_path)?;
    init_tracing(&config.general.log_level)?;

    let mut upstreams = Vec::with_capacity(config.llms.len());
    for llm in &config.llms {
        upstreams.push(Upstream::from_config(llm)?);
    }

    let pool = Pool::new(
        upstreams,
        Duration::from_secs(config.general.context_timeout_secs()),
    );
    tracing::info!(
        models = ?pool.models(),
        default_model = pool.default_model(),
        "pool initialized"
    );

    let state = AppState {
        pool: Arc::new(pool),
    };
    let app = router(state);

    let listen = format!(
        "{}:{}",
        config.general.listen_address, config.general.listen_port
    );
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "llm-relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;
    Ok(())
}
