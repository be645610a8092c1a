use anyhow::{anyhow, Result};
use futures::future::join_all;
use serde::Serialize;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use super::{
    events::{EventReceiver, GuildCommand, GuildEvent, PlayerEvent},
    guild_mutex::GuildMutex,
};
use crate::{
    audio::{
        autoplay::{AutoplayConfig, AutoplayEngine, AutoplayOutcome, Cooldown},
        player::{GuildId, PlayerHandle, PlayerRegistry, SearchResults, Track, TrackSearch},
    },
    cache::{
        search_key, BreakerMetrics, CircuitBreaker, LayeredCache, LayeredCacheConfig,
        LayeredStats, SizeInfo, TtlCacheConfig,
    },
    error::CacheResult,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    pub search_cache: LayeredCacheConfig,
    pub autoplay: AutoplayConfig,
    /// Minimum interval between two UI refreshes for the same guild
    pub ui_push_interval: Duration,
    pub ui_push_memory: TtlCacheConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            search_cache: LayeredCacheConfig::default(),
            autoplay: AutoplayConfig::default(),
            ui_push_interval: Duration::from_secs(2),
            ui_push_memory: TtlCacheConfig {
                max_size: 10_000,
                default_ttl: Duration::from_secs(300),
                cleanup_interval: Duration::from_secs(60),
            },
        }
    }
}

/// Resultado de procesar un evento
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// Track added by a play command
    pub enqueued: Option<Track>,
    pub autoplay: Option<AutoplayOutcome>,
    /// Whether the now-playing UI may be refreshed now
    pub refresh_ui: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub breaker: BreakerMetrics,
    pub search_cache: LayeredStats,
    pub search_cache_size: SizeInfo,
    pub busy_guilds: usize,
    pub autoplay_cooldowns: usize,
}

/// Entry point for everything that happens in a guild.
///
/// Owns the process-wide shared pieces (guild mutex, search cache, autoplay
/// engine, UI throttle) and runs every event for a guild through that
/// guild's queue, so handlers never race on the same player.
///
/// ## Thread Safety
///
/// Meant to live in an [`Arc`]; [`dispatch`](Self::dispatch) returns a
/// `'static` future that can be spawned.
pub struct CommandDispatcher {
    mutex: GuildMutex,
    search: Arc<dyn TrackSearch>,
    results: Arc<LayeredCache<SearchResults>>,
    autoplay: AutoplayEngine,
    ui_push: Cooldown<GuildId>,
    breaker: Arc<CircuitBreaker>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("mutex", &self.mutex)
            .field("breaker", &self.breaker)
            .field("autoplay", &self.autoplay)
            .finish()
    }
}

impl CommandDispatcher {
    /// Builds the dispatcher and every component it owns.
    ///
    /// # Arguments
    ///
    /// * `config` - Search cache, autoplay and UI throttle settings
    /// * `breaker` - Breaker over the remote store, used as the search cache L2
    /// * `search` - Search backend supplied by the bot
    ///
    /// # Errors
    ///
    /// Any invalid component configuration.
    pub fn new(
        config: DispatcherConfig,
        breaker: Arc<CircuitBreaker>,
        search: Arc<dyn TrackSearch>,
    ) -> CacheResult<Self> {
        let results = Arc::new(LayeredCache::new(config.search_cache, breaker.clone())?);
        let autoplay = AutoplayEngine::new(config.autoplay, search.clone(), results.clone())?;
        let ui_push = Cooldown::new(config.ui_push_interval, config.ui_push_memory)?;

        info!("🚦 Dispatcher de comandos listo");

        Ok(Self {
            mutex: GuildMutex::new(),
            search,
            results,
            autoplay,
            ui_push,
            breaker,
        })
    }

    /// Queues `event` behind everything already dispatched for `guild`.
    ///
    /// The queue position is taken when this is called, so events keep the
    /// order in which they were dispatched even if the futures are spawned.
    /// Errors are logged here and returned to the caller for user-facing
    /// reporting.
    pub fn dispatch(
        self: &Arc<Self>,
        guild: GuildId,
        event: GuildEvent,
        player: Arc<dyn PlayerHandle>,
    ) -> impl Future<Output = Result<DispatchReport>> + Send + 'static {
        let this = Arc::clone(self);
        let kind = event.kind();
        let key = guild.to_string();

        let queued = self.mutex.run(&key, move || async move {
            this.handle(guild, event, player.as_ref()).await
        });

        async move {
            let result = queued.await;
            if let Err(e) = &result {
                warn!(guild_id = %guild, event = kind, error = %e, "⚠️ Error procesando evento");
            }
            result
        }
    }

    /// Procesa un lote: concurrente entre guilds, en orden dentro de cada uno
    pub async fn dispatch_all(
        self: &Arc<Self>,
        batch: Vec<(GuildId, GuildEvent, Arc<dyn PlayerHandle>)>,
    ) -> Vec<Result<DispatchReport>> {
        let queued: Vec<_> = batch
            .into_iter()
            .map(|(guild, event, player)| self.dispatch(guild, event, player))
            .collect();
        join_all(queued).await
    }

    /// Consumes `events` until every sender is dropped.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: EventReceiver,
        players: Arc<dyn PlayerRegistry>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut running = Vec::new();

            while let Some(envelope) = events.recv().await {
                let Some(player) = players.player(envelope.guild) else {
                    debug!(guild_id = %envelope.guild, event = envelope.event.kind(), "Evento sin reproductor, descartado");
                    continue;
                };
                running.push(tokio::spawn(this.dispatch(envelope.guild, envelope.event, player)));

                let (finished, pending): (Vec<_>, Vec<_>) =
                    running.into_iter().partition(|task| task.is_finished());
                running = pending;
                for task in finished {
                    report_join(task.await);
                }
            }

            for task in running {
                report_join(task.await);
            }
            info!("📭 Canal de eventos cerrado");
        })
    }

    async fn handle(
        &self,
        guild: GuildId,
        event: GuildEvent,
        player: &dyn PlayerHandle,
    ) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();

        match event {
            GuildEvent::Command(GuildCommand::Play { query }) => {
                let before = player.state().await;
                let results = self.search_cached(&query).await?;
                let track = results
                    .tracks
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("Sin resultados para '{}'", query))?;

                player.enqueue(track.clone()).await?;
                info!(guild_id = %guild, track = %track.title, "🎵 Agregado a la cola");

                report.autoplay = Some(
                    self.autoplay
                        .on_first_play(guild, &before, &track, player)
                        .await,
                );
                report.enqueued = Some(track);
            }
            GuildEvent::Command(GuildCommand::Skip) => {
                let skipped = player.state().await.current;
                player.skip().await?;
                info!(guild_id = %guild, "⏭️ Track saltado");

                if let Some(skipped) = skipped {
                    report.autoplay = Some(self.autoplay.on_skip(guild, &skipped, player).await);
                }
            }
            GuildEvent::Command(GuildCommand::Resume) => {
                player.resume().await?;
            }
            GuildEvent::Command(GuildCommand::Autoplay { enabled }) => {
                self.autoplay.set_enabled(guild, enabled);
            }
            GuildEvent::Command(GuildCommand::Leave) => {
                self.autoplay.forget(guild);
                self.ui_push.reset(&guild);
                info!(guild_id = %guild, "👋 Estado del guild liberado");
            }
            GuildEvent::Player(PlayerEvent::TrackStart { track }) => {
                debug!(guild_id = %guild, track = %track.title, "▶️ Track iniciado");
            }
            GuildEvent::Player(PlayerEvent::TrackEnd { track, reason }) => {
                debug!(guild_id = %guild, track = %track.title, ?reason, "🎵 Track terminado");
                if reason.may_start_next() {
                    report.autoplay = Some(self.autoplay.on_track_end(guild, &track, player).await);
                }
            }
            GuildEvent::Player(PlayerEvent::TrackException { track, message }) => {
                warn!(guild_id = %guild, track = %track.title, error = %message, "❌ Error en track");
            }
        }

        report.refresh_ui = self.ui_push.try_acquire(guild);
        Ok(report)
    }

    async fn search_cached(&self, query: &str) -> Result<SearchResults> {
        let search = self.search.clone();
        let owned = query.to_string();
        self.results
            .get_or_set(
                &search_key(query),
                || async move { search.search(&owned).await },
                None,
            )
            .await
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            breaker: self.breaker.metrics(),
            search_cache: self.results.stats(),
            search_cache_size: self.results.size_info(),
            busy_guilds: self.mutex.active_keys().len(),
            autoplay_cooldowns: self.autoplay.cooldown().tracked(),
        }
    }

    pub fn autoplay(&self) -> &AutoplayEngine {
        &self.autoplay
    }

    pub fn search_cache(&self) -> &LayeredCache<SearchResults> {
        &self.results
    }

    /// Detiene timers y cierra la conexión remota
    pub async fn shutdown(&self) {
        info!("🛑 Cerrando dispatcher...");
        self.results.destroy();
        self.autoplay.destroy();
        self.ui_push.destroy();
        self.breaker.disconnect().await;
    }
}

/// Dispatch errors are already logged; only panics and aborts surface here.
fn report_join(result: std::result::Result<Result<DispatchReport>, JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "❌ Error en handler de evento");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{autoplay::AutoplayPhase, player::testing::FakePlayer},
        bot::events::{event_channel, GuildEnvelope, TrackEndReason},
        cache::{remote::testing::FakeStore, CircuitBreakerConfig, CircuitState},
    };
    use dashmap::DashMap;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::advance;

    const GUILD: GuildId = GuildId(1);

    /// Catálogo fijo: cada búsqueda devuelve la consulta y un relacionado
    #[derive(Default)]
    struct CatalogSearch {
        calls: AtomicUsize,
        queries: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl TrackSearch for CatalogSearch {
        async fn search(&self, query: &str) -> Result<SearchResults> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().push(query.to_string());
            if query.contains("fail") {
                anyhow::bail!("búsqueda rechazada");
            }
            Ok(SearchResults {
                tracks: vec![
                    Track::new(format!("{query}#1"), query),
                    Track::new(format!("{query}#2"), format!("{query} (related)")),
                ],
            })
        }
    }

    struct Harness {
        store: Arc<FakeStore>,
        search: Arc<CatalogSearch>,
        dispatcher: Arc<CommandDispatcher>,
    }

    fn harness() -> Harness {
        let store = Arc::new(FakeStore::new());
        let breaker = Arc::new(
            CircuitBreaker::new("l2", store.clone(), CircuitBreakerConfig::default()).unwrap(),
        );
        let search = Arc::new(CatalogSearch::default());
        let dispatcher = Arc::new(
            CommandDispatcher::new(DispatcherConfig::default(), breaker, search.clone()).unwrap(),
        );
        Harness {
            store,
            search,
            dispatcher,
        }
    }

    fn play(query: &str) -> GuildEvent {
        GuildCommand::Play {
            query: query.to_string(),
        }
        .into()
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_enqueues_and_seeds_from_idle() {
        let h = harness();
        let player = Arc::new(FakePlayer::idle());

        let report = h
            .dispatcher
            .dispatch(GUILD, play("lofi"), player.clone())
            .await
            .unwrap();

        assert_eq!(report.enqueued, Some(Track::new("lofi#1", "lofi")));
        assert!(matches!(report.autoplay, Some(AutoplayOutcome::Seeded(_))));
        assert!(report.refresh_ui);
        assert_eq!(
            player
                .enqueued()
                .iter()
                .map(|t| t.identifier.as_str())
                .collect::<Vec<_>>(),
            vec!["lofi#1", "lofi#2"]
        );
        // La semilla reutiliza la búsqueda en caché
        assert_eq!(h.search.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.dispatcher.autoplay().phase(GUILD), AutoplayPhase::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_while_busy_does_not_seed() {
        let h = harness();
        let player = Arc::new(FakePlayer::playing(Track::new("x", "Current")));

        let report = h
            .dispatcher
            .dispatch(GUILD, play("jazz"), player.clone())
            .await
            .unwrap();

        assert_eq!(report.autoplay, Some(AutoplayOutcome::Suppressed));
        assert_eq!(player.enqueued().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_search_reaches_caller_and_queue_moves_on() {
        let h = harness();
        let player = Arc::new(FakePlayer::idle());

        let results = h
            .dispatcher
            .dispatch_all(vec![
                (GUILD, play("fail please"), player.clone() as Arc<dyn PlayerHandle>),
                (GUILD, play("rock"), player.clone() as Arc<dyn PlayerHandle>),
            ])
            .await;

        assert!(results[0].is_err());
        assert_eq!(
            results[1].as_ref().unwrap().enqueued,
            Some(Track::new("rock#1", "rock"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_end_and_skip_race_yields_one_automix() {
        let h = harness();
        let ended = Track::new("song", "song");
        let player = Arc::new(FakePlayer::playing(ended.clone()));
        player.finish_current();

        let results = h
            .dispatcher
            .dispatch_all(vec![
                (
                    GUILD,
                    PlayerEvent::TrackEnd {
                        track: ended.clone(),
                        reason: TrackEndReason::Finished,
                    }
                    .into(),
                    player.clone() as Arc<dyn PlayerHandle>,
                ),
                (GUILD, GuildCommand::Skip.into(), player.clone() as Arc<dyn PlayerHandle>),
            ])
            .await;

        let first = results[0].as_ref().unwrap();
        let second = results[1].as_ref().unwrap();
        assert!(matches!(first.autoplay, Some(AutoplayOutcome::Seeded(_))));
        assert_eq!(second.autoplay, Some(AutoplayOutcome::CoolingDown));
        assert_eq!(h.search.calls.load(Ordering::SeqCst), 1);
        assert_eq!(player.skips(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_with_queue_does_not_automix() {
        let h = harness();
        let player = Arc::new(FakePlayer::playing(Track::new("a", "A")));
        player.push_queue(Track::new("b", "B"));

        let report = h
            .dispatcher
            .dispatch(GUILD, GuildCommand::Skip.into(), player.clone())
            .await
            .unwrap();

        assert_eq!(report.autoplay, Some(AutoplayOutcome::Suppressed));
        assert_eq!(h.search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_track_never_triggers_autoplay() {
        let h = harness();
        let player = Arc::new(FakePlayer::idle());

        let report = h
            .dispatcher
            .dispatch(
                GUILD,
                PlayerEvent::TrackEnd {
                    track: Track::new("a", "A"),
                    reason: TrackEndReason::Stopped,
                }
                .into(),
                player,
            )
            .await
            .unwrap();

        assert_eq!(report.autoplay, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ui_refresh_is_throttled_per_guild() {
        let h = harness();
        let player: Arc<dyn PlayerHandle> = Arc::new(FakePlayer::idle());
        let resume = || GuildEvent::from(GuildCommand::Resume);

        let first = h.dispatcher.dispatch(GUILD, resume(), player.clone()).await.unwrap();
        let second = h.dispatcher.dispatch(GUILD, resume(), player.clone()).await.unwrap();
        let other = h.dispatcher.dispatch(GuildId(2), resume(), player.clone()).await.unwrap();
        assert!(first.refresh_ui);
        assert!(!second.refresh_ui);
        assert!(other.refresh_ui);

        advance(Duration::from_secs(2)).await;
        let later = h.dispatcher.dispatch(GUILD, resume(), player).await.unwrap();
        assert!(later.refresh_ui);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoplay_toggle_and_leave() {
        let h = harness();
        let player: Arc<dyn PlayerHandle> = Arc::new(FakePlayer::idle());

        h.dispatcher
            .dispatch(GUILD, GuildCommand::Autoplay { enabled: false }.into(), player.clone())
            .await
            .unwrap();
        let report = h.dispatcher.dispatch(GUILD, play("pop"), player.clone()).await.unwrap();
        assert_eq!(report.autoplay, Some(AutoplayOutcome::Suppressed));

        h.dispatcher
            .dispatch(GUILD, GuildCommand::Leave.into(), player)
            .await
            .unwrap();
        assert!(h.dispatcher.autoplay().is_enabled(GUILD));
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_routes_by_guild() {
        let h = harness();
        let player = Arc::new(FakePlayer::idle());
        let players: DashMap<GuildId, Arc<dyn PlayerHandle>> = DashMap::new();
        players.insert(GUILD, player.clone());

        let (tx, rx) = event_channel(16);
        let task = h.dispatcher.spawn_event_loop(rx, Arc::new(players));

        tx.send(GuildEnvelope::new(GUILD, GuildCommand::Play { query: "ambient".into() }))
            .await
            .unwrap();
        tx.send(GuildEnvelope::new(GuildId(99), GuildCommand::Skip))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(player.enqueued()[0], Track::new("ambient#1", "ambient"));
    }

    struct BrokenPlayer;

    #[async_trait::async_trait]
    impl PlayerHandle for BrokenPlayer {
        async fn state(&self) -> crate::audio::PlayerState {
            panic!("estado del reproductor corrupto");
        }

        async fn enqueue(&self, _track: Track) -> Result<()> {
            Ok(())
        }

        async fn skip(&self) -> Result<()> {
            Ok(())
        }

        async fn resume(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_loop_survives_panicking_handler() {
        let h = harness();
        let broken = GuildId(5);
        let player = Arc::new(FakePlayer::idle());
        let players: DashMap<GuildId, Arc<dyn PlayerHandle>> = DashMap::new();
        players.insert(broken, Arc::new(BrokenPlayer));
        players.insert(GUILD, player.clone());

        let (tx, rx) = event_channel(16);
        let task = h.dispatcher.spawn_event_loop(rx, Arc::new(players));

        tx.send(GuildEnvelope::new(broken, GuildCommand::Play { query: "noise".into() }))
            .await
            .unwrap();
        tx.send(GuildEnvelope::new(GUILD, GuildCommand::Play { query: "jazz".into() }))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(player.enqueued()[0], Track::new("jazz#1", "jazz"));
        assert_eq!(h.dispatcher.health().busy_guilds, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_and_shutdown() {
        let h = harness();
        let player: Arc<dyn PlayerHandle> = Arc::new(FakePlayer::playing(Track::new("x", "X")));
        h.dispatcher.dispatch(GUILD, play("metal"), player).await.unwrap();

        let health = h.dispatcher.health();
        assert_eq!(health.breaker.state, CircuitState::Closed);
        assert_eq!(health.breaker.redis_status, "ready");
        assert_eq!(health.search_cache.l1.sets, 1);
        assert_eq!(health.busy_guilds, 0);

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["breaker"]["state"], "closed");
        assert!(json["searchCache"]["overall"]["hitRate"].is_number());

        h.dispatcher.shutdown().await;
        assert_eq!(h.dispatcher.health().breaker.redis_status, "end");
        assert!(h.store.data.len() >= 1);
    }
}
