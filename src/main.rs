use lagoon_ircd::irc::conf::Config;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("{}", lagoon_ircd::irc::VERSION);

    // Config comes from LAGOON_IRCD_CONFIG, with SERVER_NAME and
    // LAGOON_IRC_BIND overriding it.
    let config = Config::from_env()?;
    info!(name = %config.name, numeric = %config.numeric, hub = config.hub, "starting");

    lagoon_ircd::irc::server::run(config).await
}
