#[cfg(feature = "server")]
use tracing_subscriber::Layer as _;
#[cfg(feature = "server")]
use tracing_subscriber::layer::SubscriberExt as _;
#[cfg(feature = "server")]
use tracing_subscriber::util::SubscriberInitExt as _;

#[cfg(feature = "server")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);

    let mut listen = "127.0.0.1:8080".to_string();
    let mut dotenv_path: Option<std::path::PathBuf> = None;
    let mut json_logs = false;
    let mut memory_store = false;
    let mut stub_payments = false;
    let mut reading_url: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--dotenv" => {
                dotenv_path = Some(args.next().ok_or("missing value for --dotenv")?.into());
            }
            "--json-logs" => {
                json_logs = true;
            }
            "--memory-store" => {
                memory_store = true;
            }
            "--stub-payments" => {
                stub_payments = true;
            }
            "--reading-backend" => {
                reading_url = Some(args.next().ok_or("missing value for --reading-backend")?);
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    init_tracing(json_logs)?;

    let env = match dotenv_path.as_ref() {
        Some(path) => haetae::Env::parse_dotenv(&std::fs::read_to_string(path)?),
        None => haetae::Env::default(),
    };
    let mut config = haetae::CoreConfig::from_env(&env)?;
    if stub_payments {
        config.payment = haetae::PaymentConfig::Stub {
            paid_order_ids: Vec::new(),
        };
    }
    if let Some(url) = reading_url {
        config.reading_url = Some(url);
    }

    let store: std::sync::Arc<dyn haetae::CounterStore> = if memory_store {
        std::sync::Arc::new(haetae::MemoryCounterStore::default())
    } else {
        match config.counter_store.as_ref() {
            Some(counter) => std::sync::Arc::new(haetae::RestCounterStore::new(counter)?),
            None => {
                tracing::warn!(
                    degraded_mode = true,
                    "counter store not configured; quotas and budget run on fallbacks"
                );
                haetae::store::disabled()
            }
        }
    };

    let reading_url = config.reading_url.clone().ok_or(
        "reading backend url required (set HAETAE_READING_URL or pass --reading-backend URL)",
    )?;
    let backend = std::sync::Arc::new(haetae::HttpReadingBackend::new(reading_url)?);

    let state = haetae::HaetaeHttpState::new(
        &config,
        store,
        std::sync::Arc::new(haetae::SystemClock),
        backend,
    )?;

    let app = haetae::http::router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    println!("haetae-gateway listening on {listen}");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(feature = "server")]
fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

#[cfg(not(feature = "server"))]
fn main() {
    eprintln!("server feature disabled; rebuild with --features server");
}
