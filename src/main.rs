use clap::Parser;
use holdline::agent::ToolLoopAgent;
use holdline::api::{build_router, AppState};
use holdline::config::Settings;
use holdline::model::OpenAiModel;
use holdline::scheduler::{MockScheduler, SystemClock};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8000)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    holdline::logging::init_tracing();
    holdline::logging::setup_panic_hook();

    let args = Args::parse();
    let settings = Settings::from_env();

    if !settings.has_model_credentials() {
        tracing::warn!(
            "OPENAI_API_KEY is missing or empty; chat streaming will return 503 until it is set."
        );
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let scheduler = Arc::new(MockScheduler::new(
        Arc::new(SystemClock),
        settings.reservation_hold_minutes,
    ));
    let model = OpenAiModel::new(
        client,
        settings.model_base_url.clone(),
        settings.model_api_key.clone(),
        settings.model_name.clone(),
    );
    let agent = Arc::new(ToolLoopAgent::new(model, scheduler));

    let state = Arc::new(AppState {
        agent,
        settings: settings.clone(),
    });
    let app = build_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("{} listening on {}", settings.app_name, addr);
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}
