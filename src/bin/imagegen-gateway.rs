use std::path::PathBuf;

use clap::Parser;
use imagegen_gateway::Env;
use imagegen_gateway::gateway::{
    GatewayConfig, GatewayHttpState, TelemetryConfig, init_tracing, router,
};

#[derive(Parser, Debug)]
#[command(
    name = "imagegen-gateway",
    version,
    about = "HTTP proxy in front of remote image-generation services"
)]
struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long, short = 'c', value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to bind, overriding the config file and IMAGEGEN_LISTEN.
    #[arg(long, value_name = "HOST:PORT")]
    listen: Option<String>,

    /// Dotenv file consulted before the process environment.
    #[arg(long, value_name = "PATH", default_value = ".env")]
    dotenv: PathBuf,

    #[arg(long, value_name = "PROVIDER_TYPE")]
    default_provider: Option<String>,

    #[arg(long)]
    json_logs: bool,

    /// Export spans over OTLP (requires the `otel` feature).
    #[arg(long)]
    otel: bool,

    #[arg(long, value_name = "URL", requires = "otel")]
    otel_endpoint: Option<String>,
}

fn load_config(cli: &Cli, env: &Env) -> Result<GatewayConfig, Box<dyn std::error::Error>> {
    let mut config = match cli.config.as_deref() {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    config.apply_env(env);
    if let Some(listen) = cli.listen.clone() {
        config.listen = listen;
    }
    if let Some(default_provider) = cli.default_provider.clone() {
        config.default_provider = default_provider;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let _telemetry = init_tracing(&TelemetryConfig {
        service_name: "imagegen-gateway".to_string(),
        json_logs: cli.json_logs,
        otel: cli.otel,
        otel_endpoint: cli.otel_endpoint.clone(),
    })?;

    let env = Env::load_dotenv(&cli.dotenv)?;
    let config = load_config(&cli, &env)?;
    let state = GatewayHttpState::from_config(&config, &env)?;
    let providers: Vec<String> = state
        .service()
        .registry()
        .provider_types()
        .map(str::to_string)
        .collect();

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(
        listen = %config.listen,
        api_prefix = config.normalized_api_prefix(),
        default_provider = %config.default_provider,
        providers = ?providers,
        "imagegen-gateway listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
