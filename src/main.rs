use telemetry_analytics::{
    api,
    config::Config,
    logging::{self, LogFormat},
    metrics, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logger(LogFormat::from_env())?;
    metrics::init_metrics();

    let config = Config::from_env();
    api::serve(config).await
}
