use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use open_music_core::{
    audio::{GuildId, PlayerHandle, SearchResults, TrackSearch},
    bot::{event_channel, CommandDispatcher},
    cache::{CircuitBreaker, OfflineStore, RedisStore, RemoteStore},
    Config,
};

/// Backend de búsqueda hasta que el bot registre uno real
struct UnconfiguredSearch;

#[async_trait]
impl TrackSearch for UnconfiguredSearch {
    async fn search(&self, query: &str) -> Result<SearchResults> {
        anyhow::bail!("No hay backend de búsqueda configurado (consulta: '{}')", query)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_core=debug".parse()?)
                .add_directive("redis=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Core v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    // Conectar caché remoto, o degradar a modo offline
    let remote: Arc<dyn RemoteStore> = match RedisStore::connect(&config.redis_config()).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("❌ Error al conectar Redis: {}", e);
            warn!("🔄 Continuando sin Redis - solo caché local y fallback");
            Arc::new(OfflineStore::new())
        }
    };

    let breaker = Arc::new(CircuitBreaker::new(
        "search-cache",
        remote,
        config.breaker_config(),
    )?);
    let dispatcher = Arc::new(CommandDispatcher::new(
        config.dispatcher_config(),
        breaker,
        Arc::new(UnconfiguredSearch),
    )?);

    // El adaptador del bot registra aquí un reproductor por guild
    let players: Arc<DashMap<GuildId, Arc<dyn PlayerHandle>>> = Arc::new(DashMap::new());
    let (events, receiver) = event_channel(1024);
    let event_loop = dispatcher.spawn_event_loop(receiver, players);

    // Log periódico de salud
    let health_task = {
        let dispatcher = dispatcher.clone();
        let every = config.health_log_interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match serde_json::to_string(&dispatcher.health()) {
                    Ok(health) => info!("📊 Salud: {}", health),
                    Err(e) => warn!("No se pudo serializar el estado de salud: {}", e),
                }
            }
        })
    };

    info!("🚀 Core iniciado, esperando eventos");

    // Manejar shutdown graceful
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error al registrar Ctrl+C: {:?}", e);
    }
    info!("⚠️ Señal de shutdown recibida, cerrando...");

    drop(events);
    health_task.abort();
    if let Err(e) = event_loop.await {
        error!("Error en el loop de eventos: {:?}", e);
    }
    dispatcher.shutdown().await;

    info!("👋 Apagado completo");
    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    let store = RedisStore::connect(&config.redis_config()).await?;
    store.get("health:probe").await?;
    store.disconnect().await;

    println!("OK");
    Ok(())
}
