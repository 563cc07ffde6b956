use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use open_music_relay::cookies::RankedArtifact;
use open_music_relay::store::{KvStore, MemoryStore, RedisStore};
use open_music_relay::telemetry::{GlobalMetrics, LeaderboardRow};
use open_music_relay::Config;

const LEADERBOARD_SIZE: usize = 10;

/// Estado que imprime el modo reporte
#[derive(Debug, Serialize)]
struct Report {
    store: &'static str,
    key_space: String,
    generated_at: String,
    candidates: Vec<RankedArtifact>,
    metrics: GlobalMetrics,
    leaderboard: Vec<LeaderboardRow>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_relay=debug".parse()?)
                .add_directive("redis=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("🎵 Iniciando Open Music Relay v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    let health_check = std::env::args().any(|arg| arg == "--health-check");
    let (store, backend) = connect_store(&config, health_check).await?;

    if health_check {
        return run_health_check(&config, store.as_ref()).await;
    }

    report(&config, store, backend).await
}

/// Conecta a Redis; si no está disponible sigue con el almacén en memoria.
/// El health check en cambio exige Redis.
async fn connect_store(config: &Config, strict: bool) -> Result<(Arc<dyn KvStore>, &'static str)> {
    match RedisStore::connect(&config.redis_url, config.store_timeout()).await {
        Ok(store) => Ok((Arc::new(store), "redis")),
        Err(e) if strict => anyhow::bail!("Redis no disponible: {}", e),
        Err(e) => {
            warn!("⚠️ Redis no disponible ({}), usando almacén en memoria", e);
            Ok((Arc::new(MemoryStore::new()), "memory"))
        }
    }
}

async fn run_health_check(config: &Config, store: &dyn KvStore) -> Result<()> {
    if let Err(e) = store.ping().await {
        error!("❌ Redis no responde: {}", e);
        anyhow::bail!("Almacén no disponible");
    }

    let artifacts = match config.artifact_directory().list().await {
        Ok(artifacts) => artifacts,
        Err(e) => {
            error!("❌ {}", e);
            anyhow::bail!("Sin cookies utilizables");
        }
    };

    for artifact in &artifacts {
        println!("cookie {}", artifact.name);
    }
    println!("OK");
    Ok(())
}

async fn report(config: &Config, store: Arc<dyn KvStore>, backend: &'static str) -> Result<()> {
    let pool = config.cookie_pool(store.clone());
    let telemetry = config.telemetry(store);

    let candidates = match config.artifact_directory().list().await {
        Ok(artifacts) => pool.rank_with_scores(&artifacts).await,
        Err(e) => {
            warn!("⚠️ {}", e);
            Vec::new()
        }
    };

    let report = Report {
        store: backend,
        key_space: config.key_space().to_string(),
        generated_at: chrono::Utc::now().to_rfc3339(),
        candidates,
        metrics: telemetry.snapshot().await,
        leaderboard: telemetry.leaderboard(LEADERBOARD_SIZE).await,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
