use anyhow::Context as _;
use beckn_p2p::{
    clock::{SystemTimeSource, TimeSource},
    config::{create_default_config_file, AppConfig},
    database::SqliteBackend,
    discovery::{RegistryClient, SubscriberType},
    keys::{decode_public_key, KeyId},
    server,
    store::{KvBackend, MemoryBackend},
    telemetry, ProtocolEngine,
};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "protocol-node")]
#[command(about = "Beckn protocol node for peer-to-peer energy trading")]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Write a default config file to --config and exit
    #[arg(long)]
    init_config: bool,

    #[arg(short, long)]
    port: Option<u16>,

    /// Publish this node's key to the registry on startup
    #[arg(long)]
    subscribe: bool,

    /// Resolve unknown signer keys from the registry
    #[arg(long)]
    resolve_keys: bool,

    /// Trusted counterparty key as `subscriber|key|ed25519=<base64 public key>`
    #[arg(long = "peer-key")]
    peer_keys: Vec<String>,

    #[arg(long, default_value = "60")]
    purge_interval_seconds: u64,
}

enum Backend {
    Memory(Arc<MemoryBackend>),
    Sqlite(Arc<SqliteBackend>),
}

impl Backend {
    async fn open(config: &AppConfig, clock: Arc<dyn TimeSource>) -> anyhow::Result<Self> {
        if config.is_sqlite_store() {
            let backend = SqliteBackend::with_clock(&config.store.url, clock)
                .await
                .with_context(|| format!("opening {}", config.store.url))?;
            Ok(Backend::Sqlite(Arc::new(backend)))
        } else {
            Ok(Backend::Memory(Arc::new(MemoryBackend::with_clock(clock))))
        }
    }

    fn as_kv(&self) -> Arc<dyn KvBackend> {
        match self {
            Backend::Memory(backend) => backend.clone() as Arc<dyn KvBackend>,
            Backend::Sqlite(backend) => backend.clone(),
        }
    }

    async fn purge_expired(&self) -> u64 {
        match self {
            Backend::Memory(backend) => backend.purge_expired() as u64,
            Backend::Sqlite(backend) => match backend.purge_expired().await {
                Ok(removed) => removed,
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to purge expired entries");
                    0
                }
            },
        }
    }
}

fn parse_peer_key(raw: &str) -> anyhow::Result<(KeyId, ed25519_dalek::VerifyingKey)> {
    let (key_id, public_key) = raw
        .split_once('=')
        .with_context(|| format!("peer key must look like keyId=publicKey, got {}", raw))?;
    Ok((key_id.parse()?, decode_public_key(public_key)?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.init_config {
        create_default_config_file(&args.config)?;
        println!("Wrote default config to {}", args.config);
        return Ok(());
    }

    let mut config = if Path::new(&args.config).exists() {
        AppConfig::load_with_env_overrides(&args.config)?
    } else {
        AppConfig::default()
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    telemetry::init_tracing(&config.logging)?;

    let clock: Arc<dyn TimeSource> = Arc::new(SystemTimeSource);
    let backend = Backend::open(&config, clock.clone()).await?;

    let mut engine = ProtocolEngine::from_config(&config, backend.as_kv(), clock)?;

    let registry_timeout = config.registry.timeout_seconds.map(Duration::from_secs);
    let registry_client = Arc::new(RegistryClient::new(config.registry.endpoint.clone(), registry_timeout)?);
    if args.resolve_keys {
        engine = engine.with_resolver(registry_client.clone());
    }

    for raw in &args.peer_keys {
        let (key_id, public_key) = parse_peer_key(raw)?;
        engine.registry().register(key_id, public_key);
    }

    if args.subscribe {
        let subscriber_type = SubscriberType::from_role(&config.identity.role)?;
        registry_client
            .subscribe(
                engine.key_pair(),
                &config.identity.subscriber_uri,
                subscriber_type,
                &config.identity.domain,
            )
            .await
            .context("subscribing to registry")?;
    }

    let engine = Arc::new(engine);

    let purge_interval = Duration::from_secs(args.purge_interval_seconds.max(1));
    let purger = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(purge_interval);
        loop {
            ticker.tick().await;
            let removed = backend.purge_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "Purged expired store entries");
            }
        }
    });

    let app = server::router(engine.clone());
    let address = config.get_server_address();
    let listener = TcpListener::bind(&address).await?;

    tracing::info!(
        address = %address,
        key_id = %engine.key_id(),
        public_key = %engine.key_pair().public_key_base64(),
        role = %config.identity.role,
        "Protocol node listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    purger.abort();
    tracing::info!("Protocol node stopped");
    Ok(())
}
