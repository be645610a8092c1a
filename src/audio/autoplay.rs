//! # Autoplay
//!
//! Decides when to enqueue a related track so playback doesn't go silent,
//! and runs the seed search when it should.
//!
//! The gating functions are pure: they only look at the snapshot they are
//! given. [`AutoplayEngine`] adds the per-guild lifecycle on top:
//!
//! ```text
//! Idle ──(end/skip with empty queue, enabled, cooldown elapsed)──▶ Triggered
//! Triggered ──(search ok, track enqueued)──▶ Playing
//! Triggered ──(search failed / nothing usable)──▶ Idle
//! ```
//!
//! A [`Cooldown`] per guild absorbs racing triggers, e.g. a track-end event
//! and a skip command landing a few milliseconds apart.

use dashmap::DashMap;
use serde::Serialize;
use std::{hash::Hash, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::player::{GuildId, PlayerHandle, PlayerState, RepeatMode, SearchResults, Track, TrackSearch};
use crate::{
    cache::{search_key, LayeredCache, TtlCache, TtlCacheConfig},
    error::{CacheError, CacheResult},
};

/// Estado leído antes de iniciar una reproducción
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedState {
    pub autoplay_enabled: bool,
    pub playing: bool,
    pub paused: bool,
    pub has_current: bool,
}

impl SeedState {
    pub fn from_player(state: &PlayerState, autoplay_enabled: bool) -> Self {
        Self {
            autoplay_enabled,
            playing: state.playing,
            paused: state.paused,
            has_current: state.current.is_some(),
        }
    }
}

/// Estado leído después de un skip o fin de track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipState {
    pub repeat_mode: RepeatMode,
    pub playing: bool,
    pub has_current: bool,
    pub queue_len: usize,
    pub autoplay_enabled: bool,
}

impl SkipState {
    pub fn from_player(state: &PlayerState, autoplay_enabled: bool) -> Self {
        Self {
            repeat_mode: state.repeat_mode,
            playing: state.playing,
            has_current: state.current.is_some(),
            queue_len: state.queue_len,
            autoplay_enabled,
        }
    }
}

/// Seeding only happens when playback starts from a fully idle player.
pub fn should_seed_on_first_play(state: &SeedState) -> bool {
    state.autoplay_enabled && !state.playing && !state.paused && !state.has_current
}

/// Automix only fills true silence and never overrides repeat or a queue.
pub fn should_automix_after_skip(state: &SkipState) -> bool {
    state.repeat_mode == RepeatMode::Off
        && !state.playing
        && !state.has_current
        && state.queue_len == 0
        && state.autoplay_enabled
}

/// Minimum interval between two accepted triggers for the same key.
///
/// The backing [`TtlCache`] only bounds memory; the debounce compares the
/// stored instant against `window` regardless of TTL expiry.
#[derive(Debug)]
pub struct Cooldown<K> {
    last: TtlCache<K, Instant>,
    window: Duration,
}

pub type AutoplayCooldown = Cooldown<GuildId>;

impl<K> Cooldown<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(window: Duration, memory: TtlCacheConfig) -> CacheResult<Self> {
        if window.is_zero() {
            return Err(CacheError::InvalidConfig(
                "la ventana de cooldown debe ser mayor que 0".to_string(),
            ));
        }
        Ok(Self {
            last: TtlCache::new(memory)?,
            window,
        })
    }

    /// Records a trigger for `key` unless the previous one is too recent.
    pub fn try_acquire(&self, key: K) -> bool {
        let now = Instant::now();
        let window = self.window;
        self.last.set_if(key, now, None, |previous| match previous {
            Some(last) => now.duration_since(*last) >= window,
            None => true,
        })
    }

    /// Tiempo restante de cooldown, si lo hay
    pub fn remaining(&self, key: &K) -> Option<Duration> {
        let last = self.last.get(key)?;
        let elapsed = Instant::now().duration_since(last);
        self.window.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    pub fn reset(&self, key: &K) {
        self.last.remove(key);
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn tracked(&self) -> usize {
        self.last.len()
    }

    pub fn destroy(&self) {
        self.last.destroy();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AutoplayConfig {
    /// Default for guilds without an explicit toggle
    pub enabled: bool,
    pub cooldown: Duration,
    /// Memory bound for the cooldown tracker
    pub cooldown_ttl: Duration,
    pub max_tracked_guilds: usize,
    pub cleanup_interval: Duration,
}

impl Default for AutoplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown: Duration::from_millis(1500),
            cooldown_ttl: Duration::from_secs(300), // 5 minutos
            max_tracked_guilds: 10_000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl AutoplayConfig {
    pub fn validate(&self) -> CacheResult<()> {
        if self.cooldown.is_zero() {
            return Err(CacheError::InvalidConfig(
                "autoplay cooldown debe ser mayor que 0".to_string(),
            ));
        }
        if self.cooldown_ttl < self.cooldown {
            return Err(CacheError::InvalidConfig(
                "autoplay cooldown_ttl no puede ser menor que cooldown".to_string(),
            ));
        }
        self.cooldown_memory().validate()
    }

    fn cooldown_memory(&self) -> TtlCacheConfig {
        TtlCacheConfig {
            max_size: self.max_tracked_guilds,
            default_ttl: self.cooldown_ttl,
            cleanup_interval: self.cleanup_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoplayPhase {
    #[default]
    Idle,
    Triggered,
    Playing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoplayOutcome {
    /// Gate said no (autoplay off, repeat on, queue not empty...)
    Suppressed,
    CoolingDown,
    /// Another trigger for the guild is still searching
    InFlight,
    Seeded(Track),
    NoResults,
    SearchFailed,
    EnqueueFailed,
}

impl AutoplayOutcome {
    pub fn seeded(&self) -> Option<&Track> {
        match self {
            AutoplayOutcome::Seeded(track) => Some(track),
            _ => None,
        }
    }
}

/// Primer resultado que no sea el track semilla
pub fn pick_candidate(results: &SearchResults, seed: &Track) -> Option<Track> {
    results
        .tracks
        .iter()
        .find(|track| track.identifier != seed.identifier)
        .cloned()
}

/// Sends the guild back to Idle if a trigger is dropped before it settles.
struct PhaseGuard<'a> {
    phases: &'a DashMap<GuildId, AutoplayPhase>,
    guild: GuildId,
    armed: bool,
}

impl PhaseGuard<'_> {
    fn settle(mut self, phase: AutoplayPhase) {
        self.armed = false;
        self.phases.insert(self.guild, phase);
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.phases.insert(self.guild, AutoplayPhase::Idle);
            debug!(guild_id = %self.guild, "Autoplay cancelado durante la búsqueda");
        }
    }
}

pub struct AutoplayEngine {
    config: AutoplayConfig,
    search: Arc<dyn TrackSearch>,
    results: Arc<LayeredCache<SearchResults>>,
    cooldown: AutoplayCooldown,
    phases: DashMap<GuildId, AutoplayPhase>,
    toggles: DashMap<GuildId, bool>,
}

impl std::fmt::Debug for AutoplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoplayEngine")
            .field("config", &self.config)
            .field("guilds", &self.phases.len())
            .finish()
    }
}

impl AutoplayEngine {
    pub fn new(
        config: AutoplayConfig,
        search: Arc<dyn TrackSearch>,
        results: Arc<LayeredCache<SearchResults>>,
    ) -> CacheResult<Self> {
        config.validate()?;
        let cooldown = Cooldown::new(config.cooldown, config.cooldown_memory())?;

        info!(
            enabled = config.enabled,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "🎲 Motor de autoplay inicializado"
        );

        Ok(Self {
            config,
            search,
            results,
            cooldown,
            phases: DashMap::new(),
            toggles: DashMap::new(),
        })
    }

    pub fn is_enabled(&self, guild: GuildId) -> bool {
        self.toggles
            .get(&guild)
            .map_or(self.config.enabled, |enabled| *enabled)
    }

    pub fn set_enabled(&self, guild: GuildId, enabled: bool) {
        self.toggles.insert(guild, enabled);
        info!(guild_id = %guild, enabled, "🎲 Autoplay actualizado");
    }

    pub fn phase(&self, guild: GuildId) -> AutoplayPhase {
        self.phases
            .get(&guild)
            .map_or(AutoplayPhase::Idle, |phase| *phase)
    }

    /// Olvida todo el estado del guild (al salir del canal)
    pub fn forget(&self, guild: GuildId) {
        self.phases.remove(&guild);
        self.toggles.remove(&guild);
        self.cooldown.reset(&guild);
    }

    /// `before` is the player snapshot taken before `requested` was enqueued.
    pub async fn on_first_play(
        &self,
        guild: GuildId,
        before: &PlayerState,
        requested: &Track,
        player: &dyn PlayerHandle,
    ) -> AutoplayOutcome {
        let state = SeedState::from_player(before, self.is_enabled(guild));
        if !should_seed_on_first_play(&state) {
            debug!(guild_id = %guild, ?state, "Autoplay: sin semilla, el reproductor no estaba inactivo");
            return AutoplayOutcome::Suppressed;
        }
        self.trigger(guild, requested, player).await
    }

    pub async fn on_track_end(
        &self,
        guild: GuildId,
        ended: &Track,
        player: &dyn PlayerHandle,
    ) -> AutoplayOutcome {
        self.after_transition(guild, ended, player).await
    }

    /// Called after the skip has been applied to the player.
    pub async fn on_skip(
        &self,
        guild: GuildId,
        skipped: &Track,
        player: &dyn PlayerHandle,
    ) -> AutoplayOutcome {
        self.after_transition(guild, skipped, player).await
    }

    async fn after_transition(
        &self,
        guild: GuildId,
        seed: &Track,
        player: &dyn PlayerHandle,
    ) -> AutoplayOutcome {
        let snapshot = player.state().await;
        let state = SkipState::from_player(&snapshot, self.is_enabled(guild));
        if !should_automix_after_skip(&state) {
            debug!(guild_id = %guild, ?state, "Autoplay suprimido");
            return AutoplayOutcome::Suppressed;
        }
        self.trigger(guild, seed, player).await
    }

    /// Searches for something related to `seed` and enqueues it.
    ///
    /// Skips the player-state gate; the cooldown and the in-flight guard
    /// still apply.
    pub async fn trigger(
        &self,
        guild: GuildId,
        seed: &Track,
        player: &dyn PlayerHandle,
    ) -> AutoplayOutcome {
        {
            let mut phase = self.phases.entry(guild).or_default();
            if *phase == AutoplayPhase::Triggered {
                debug!(guild_id = %guild, "Autoplay ya en curso");
                return AutoplayOutcome::InFlight;
            }
            if !self.cooldown.try_acquire(guild) {
                debug!(guild_id = %guild, "⏳ Autoplay en cooldown");
                return AutoplayOutcome::CoolingDown;
            }
            *phase = AutoplayPhase::Triggered;
        }
        let guard = PhaseGuard {
            phases: &self.phases,
            guild,
            armed: true,
        };

        let query = seed.seed_query();
        info!(guild_id = %guild, query = %query, "🎲 Autoplay: buscando semilla");

        let search = self.search.clone();
        let loader_query = query.clone();
        let results = self
            .results
            .get_or_set(
                &search_key(&query),
                || async move { search.search(&loader_query).await },
                None,
            )
            .await;

        let results = match results {
            Ok(results) => results,
            Err(e) => {
                warn!(guild_id = %guild, query = %query, error = %e, "⚠️ Autoplay: la búsqueda falló");
                guard.settle(AutoplayPhase::Idle);
                return AutoplayOutcome::SearchFailed;
            }
        };

        let Some(candidate) = pick_candidate(&results, seed) else {
            info!(guild_id = %guild, query = %query, "Autoplay: sin resultados utilizables");
            guard.settle(AutoplayPhase::Idle);
            return AutoplayOutcome::NoResults;
        };

        match player.enqueue(candidate.clone()).await {
            Ok(()) => {
                info!(guild_id = %guild, track = %candidate.title, "✅ Autoplay: track agregado");
                guard.settle(AutoplayPhase::Playing);
                AutoplayOutcome::Seeded(candidate)
            }
            Err(e) => {
                warn!(guild_id = %guild, error = %e, "⚠️ Autoplay: no se pudo encolar");
                guard.settle(AutoplayPhase::Idle);
                AutoplayOutcome::EnqueueFailed
            }
        }
    }

    pub fn cooldown(&self) -> &AutoplayCooldown {
        &self.cooldown
    }

    pub fn destroy(&self) {
        self.cooldown.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::player::{testing::FakePlayer, MockTrackSearch},
        cache::{remote::testing::FakeStore, CircuitBreaker, CircuitBreakerConfig, LayeredCacheConfig},
    };
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::advance;

    const GUILD: GuildId = GuildId(42);

    fn idle_seed() -> SeedState {
        SeedState {
            autoplay_enabled: true,
            playing: false,
            paused: false,
            has_current: false,
        }
    }

    fn idle_skip() -> SkipState {
        SkipState {
            repeat_mode: RepeatMode::Off,
            playing: false,
            has_current: false,
            queue_len: 0,
            autoplay_enabled: true,
        }
    }

    fn results_cache() -> Arc<LayeredCache<SearchResults>> {
        let breaker =
            CircuitBreaker::new("search", Arc::new(FakeStore::new()), CircuitBreakerConfig::default())
                .unwrap();
        Arc::new(LayeredCache::new(LayeredCacheConfig::default(), Arc::new(breaker)).unwrap())
    }

    fn engine(search: impl TrackSearch + 'static) -> AutoplayEngine {
        AutoplayEngine::new(AutoplayConfig::default(), Arc::new(search), results_cache()).unwrap()
    }

    fn related(seed: &Track) -> SearchResults {
        SearchResults {
            tracks: vec![seed.clone(), Track::new("rel-1", "Related One")],
        }
    }

    #[test]
    fn test_seed_gate_requires_fully_idle_player() {
        assert!(should_seed_on_first_play(&idle_seed()));

        let flipped = [
            SeedState { autoplay_enabled: false, ..idle_seed() },
            SeedState { playing: true, ..idle_seed() },
            SeedState { paused: true, ..idle_seed() },
            SeedState { has_current: true, ..idle_seed() },
        ];
        for state in flipped {
            assert!(!should_seed_on_first_play(&state), "{state:?}");
        }
    }

    #[test]
    fn test_automix_gate_respects_every_condition() {
        assert!(should_automix_after_skip(&idle_skip()));

        let flipped = [
            SkipState { repeat_mode: RepeatMode::Track, ..idle_skip() },
            SkipState { repeat_mode: RepeatMode::Queue, ..idle_skip() },
            SkipState { playing: true, ..idle_skip() },
            SkipState { has_current: true, ..idle_skip() },
            SkipState { queue_len: 3, ..idle_skip() },
            SkipState { autoplay_enabled: false, ..idle_skip() },
        ];
        for state in flipped {
            assert!(!should_automix_after_skip(&state), "{state:?}");
        }
    }

    #[test]
    fn test_automix_never_fires_with_queued_track() {
        for repeat_mode in [RepeatMode::Off, RepeatMode::Track, RepeatMode::Queue] {
            for playing in [false, true] {
                for has_current in [false, true] {
                    for autoplay_enabled in [false, true] {
                        let state = SkipState {
                            repeat_mode,
                            playing,
                            has_current,
                            queue_len: 1,
                            autoplay_enabled,
                        };
                        assert!(!should_automix_after_skip(&state));
                    }
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_window_is_independent_of_ttl() {
        let cooldown = AutoplayCooldown::new(
            Duration::from_millis(1500),
            TtlCacheConfig {
                max_size: 10,
                default_ttl: Duration::from_secs(300),
                cleanup_interval: Duration::from_secs(60),
            },
        )
        .unwrap();

        assert!(cooldown.try_acquire(GUILD));
        assert!(!cooldown.try_acquire(GUILD));
        assert!(cooldown.try_acquire(GuildId(7)));

        advance(Duration::from_millis(1000)).await;
        assert!(!cooldown.try_acquire(GUILD));
        assert_eq!(cooldown.remaining(&GUILD), Some(Duration::from_millis(500)));

        advance(Duration::from_millis(500)).await;
        assert!(cooldown.try_acquire(GUILD));

        advance(Duration::from_secs(301)).await;
        assert_eq!(cooldown.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_triggers_search_once() {
        let first = Track::new("seed-1", "First Seed");
        let second = Track::new("seed-2", "Second Seed");

        let mut search = MockTrackSearch::new();
        search.expect_search().times(1).returning(|_| {
            Ok(SearchResults {
                tracks: vec![Track::new("rel-1", "Related One")],
            })
        });
        let engine = engine(search);
        let player = FakePlayer::idle();

        let outcome = engine.trigger(GUILD, &first, &player).await;
        assert_eq!(outcome.seeded().map(|t| t.identifier.as_str()), Some("rel-1"));

        advance(Duration::from_millis(20)).await;
        assert_eq!(
            engine.trigger(GUILD, &second, &player).await,
            AutoplayOutcome::CoolingDown
        );
        assert_eq!(player.enqueued().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_allowed_again_after_window() {
        let mut search = MockTrackSearch::new();
        search
            .expect_search()
            .times(2)
            .returning(|query| {
                Ok(SearchResults {
                    tracks: vec![Track::new(format!("rel:{query}"), "Related")],
                })
            });
        let engine = engine(search);
        let player = FakePlayer::idle();

        engine.trigger(GUILD, &Track::new("a", "A"), &player).await;
        advance(Duration::from_millis(1500)).await;
        let outcome = engine.trigger(GUILD, &Track::new("b", "B"), &player).await;

        assert!(matches!(outcome, AutoplayOutcome::Seeded(_)));
        assert_eq!(engine.phase(GUILD), AutoplayPhase::Playing);
    }

    struct SlowSearch {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl TrackSearch for SlowSearch {
        async fn search(&self, _query: &str) -> anyhow::Result<SearchResults> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(SearchResults {
                tracks: vec![Track::new("slow", "Slow Result")],
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_trigger_while_searching_is_in_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine(SlowSearch { calls: calls.clone() });
        let player = FakePlayer::idle();
        let seed = Track::new("seed", "Seed");

        let (first, second) = tokio::join!(
            engine.trigger(GUILD, &seed, &player),
            engine.trigger(GUILD, &seed, &player)
        );

        assert!(matches!(first, AutoplayOutcome::Seeded(_)));
        assert_eq!(second, AutoplayOutcome::InFlight);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trigger_returns_to_idle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine(SlowSearch { calls: calls.clone() });
        let player = FakePlayer::idle();
        let seed = Track::new("seed", "Seed");

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), engine.trigger(GUILD, &seed, &player))
                .await;
        assert!(cancelled.is_err());
        assert_eq!(engine.phase(GUILD), AutoplayPhase::Idle);

        advance(Duration::from_secs(600)).await;
        let outcome = engine.trigger(GUILD, &seed, &player).await;

        assert_eq!(outcome.seeded().map(|t| t.identifier.as_str()), Some("slow"));
        assert_eq!(engine.phase(GUILD), AutoplayPhase::Playing);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_search_returns_to_idle() {
        let mut search = MockTrackSearch::new();
        search
            .expect_search()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("límite de peticiones")));
        let engine = engine(search);
        let player = FakePlayer::idle();

        let outcome = engine.trigger(GUILD, &Track::new("a", "A"), &player).await;

        assert_eq!(outcome, AutoplayOutcome::SearchFailed);
        assert_eq!(engine.phase(GUILD), AutoplayPhase::Idle);
        assert!(player.enqueued().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_seed_in_results_means_no_results() {
        let seed = Track::new("seed", "Seed");
        let only_seed = SearchResults {
            tracks: vec![seed.clone()],
        };

        let mut search = MockTrackSearch::new();
        search
            .expect_search()
            .times(1)
            .returning(move |_| Ok(only_seed.clone()));
        let engine = engine(search);

        let outcome = engine.trigger(GUILD, &seed, &FakePlayer::idle()).await;
        assert_eq!(outcome, AutoplayOutcome::NoResults);
        assert_eq!(engine.phase(GUILD), AutoplayPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_end_with_repeat_is_suppressed() {
        let mut search = MockTrackSearch::new();
        search.expect_search().never();
        let engine = engine(search);

        let ended = Track::new("ended", "Ended");
        let player = FakePlayer::idle();
        player.set_repeat_mode(RepeatMode::Queue);

        assert_eq!(
            engine.on_track_end(GUILD, &ended, &player).await,
            AutoplayOutcome::Suppressed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_end_on_silent_player_seeds_related() {
        let ended = Track::new("ended", "Ended").with_author("Artist");
        let results = related(&ended);

        let mut search = MockTrackSearch::new();
        search
            .expect_search()
            .withf(|query: &str| query == "Artist Ended")
            .times(1)
            .returning(move |_| Ok(results.clone()));
        let engine = engine(search);

        let player = FakePlayer::playing(ended.clone());
        player.finish_current();

        let outcome = engine.on_track_end(GUILD, &ended, &player).await;
        assert_eq!(outcome.seeded().map(|t| t.identifier.as_str()), Some("rel-1"));
        assert_eq!(player.enqueued(), vec![Track::new("rel-1", "Related One")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_play_only_seeds_from_idle() {
        let requested = Track::new("req", "Requested");
        let results = related(&requested);

        let mut search = MockTrackSearch::new();
        search
            .expect_search()
            .times(1)
            .returning(move |_| Ok(results.clone()));
        let engine = engine(search);
        let player = FakePlayer::idle();

        let busy = PlayerState {
            playing: true,
            current: Some(Track::new("other", "Other")),
            ..Default::default()
        };
        assert_eq!(
            engine.on_first_play(GUILD, &busy, &requested, &player).await,
            AutoplayOutcome::Suppressed
        );

        let outcome = engine
            .on_first_play(GUILD, &PlayerState::default(), &requested, &player)
            .await;
        assert!(matches!(outcome, AutoplayOutcome::Seeded(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guild_toggle_overrides_default() {
        let mut search = MockTrackSearch::new();
        search.expect_search().never();
        let engine = engine(search);

        engine.set_enabled(GUILD, false);
        assert!(!engine.is_enabled(GUILD));
        assert!(engine.is_enabled(GuildId(1)));

        let outcome = engine
            .on_first_play(GUILD, &PlayerState::default(), &Track::new("a", "A"), &FakePlayer::idle())
            .await;
        assert_eq!(outcome, AutoplayOutcome::Suppressed);

        engine.forget(GUILD);
        assert!(engine.is_enabled(GUILD));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = AutoplayConfig {
            cooldown: Duration::from_secs(10),
            cooldown_ttl: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));
    }
}
