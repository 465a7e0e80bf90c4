// ============================================================================
// ChartSession : point d'entrée unique de la boucle d'événements
// ============================================================================
// Une session lie un binding (symbole, résolution) à :
// - exactement un SeriesStore + un IndicatorPipeline (jamais partagés)
// - le gestionnaire de panneaux et le coordinateur de vue
//
// FLUX :
//   select(binding) → LoadTicket (le runtime lance historique + flux)
//   on_history(token, seed) → seed du store → indicateurs → panneaux
//   on_tick(token, tick)    → store → indicateurs (queue) → panneaux
//
// RequestToken :
// - Chaque select() incrémente le token
// - Toute réponse (historique ou tick) portant un ancien token est ignorée
//
// Ticks pendant le chargement : mis en tampon (borné), rejoués après le seed
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::indicators::{IndicatorBaseline, IndicatorConfig, IndicatorPipeline, IndicatorSet};
use crate::engine::pane::{PaneFactory, PaneKind, PaneLifecycleManager};
use crate::engine::store::{SeriesSnapshot, SeriesStore, SnapshotSlot, StoreStats};
use crate::engine::view_sync::{PaneId, ViewSyncCoordinator};
use crate::error::ChartError;
use crate::models::{Bar, Resolution, Tick, ViewRange};

/// Ce qu'une session affiche : un symbole à une résolution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub symbol: String,
    pub resolution: Resolution,
}

impl Binding {
    pub fn new(symbol: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            symbol: symbol.into().trim().to_uppercase(),
            resolution,
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.symbol, self.resolution)
    }
}

/// Jeton de requête : identifie le binding qui a émis une requête
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RequestToken(pub u64);

/// Historique livré par le HistoryLoader
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySeed {
    pub bars: Vec<Bar>,
    /// Valeurs précalculées par le serveur (optionnelles)
    pub baseline: Option<IndicatorBaseline>,
}

/// Événements envoyés par les tâches d'I/O à la boucle principale
#[derive(Debug)]
pub enum EngineEvent {
    History {
        token: RequestToken,
        result: Result<HistorySeed, ChartError>,
    },
    Tick {
        token: RequestToken,
        tick: Tick,
    },
}

/// État de chargement visible par l'utilisateur
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    /// Aucun binding
    Idle,
    /// Historique en cours de chargement
    Loading,
    /// Historique chargé
    Ready,
    /// Historique indisponible : état explicite, les ticks live restent affichés
    Unavailable(String),
}

/// Requête à exécuter par le runtime après un select()
#[derive(Debug, Clone)]
pub struct LoadTicket {
    pub token: RequestToken,
    pub binding: Binding,
    /// Annulé au prochain select() (fetch + abonnement)
    pub cancel: CancellationToken,
}

/// Réglages d'une session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Nombre de barres visibles au cadrage initial
    pub visible_bars: usize,
    /// Taille max du tampon de ticks pendant le chargement
    pub tick_buffer: usize,
    /// Écart relatif toléré avec les valeurs serveur
    pub baseline_tolerance: f64,
    pub indicators: IndicatorConfig,
    pub panes: Vec<PaneKind>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            visible_bars: 120,
            tick_buffer: 1024,
            baseline_tolerance: 0.01,
            indicators: IndicatorConfig::default(),
            panes: PaneKind::all().to_vec(),
        }
    }
}

/// Compteurs de session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub stale_responses: u64,
    pub buffered_ticks: u64,
    pub buffer_overflows: u64,
    pub defensive_drops: u64,
    pub reloads: u64,
}

/// Session de graphique
pub struct ChartSession<F: PaneFactory> {
    options: SessionOptions,
    binding: Option<Binding>,
    token: RequestToken,
    cancel: Option<CancellationToken>,
    state: LoadState,
    store: Option<SeriesStore>,
    pipeline: IndicatorPipeline,
    pipeline_slot: SnapshotSlot,
    panes: PaneLifecycleManager<F>,
    sync: ViewSyncCoordinator,
    pending_ticks: VecDeque<Tick>,
    last_open_time: Option<i64>,
    stats: SessionStats,
}

impl<F: PaneFactory> ChartSession<F> {
    pub fn new(factory: F, options: SessionOptions) -> Self {
        let panes = PaneLifecycleManager::new(factory, &options.panes);
        let pipeline = IndicatorPipeline::new(options.indicators.clone());
        Self {
            options,
            binding: None,
            token: RequestToken::default(),
            cancel: None,
            state: LoadState::Idle,
            store: None,
            pipeline,
            pipeline_slot: SnapshotSlot::new(),
            panes,
            sync: ViewSyncCoordinator::new(),
            pending_ticks: VecDeque::new(),
            last_open_time: None,
            stats: SessionStats::default(),
        }
    }

    // ========================================================================
    // Accesseurs
    // ========================================================================

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    pub fn token(&self) -> RequestToken {
        self.token
    }

    pub fn state(&self) -> &LoadState {
        &self.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn store_stats(&self) -> Option<StoreStats> {
        self.store.as_ref().map(SeriesStore::stats)
    }

    pub fn is_live(&self) -> bool {
        self.store.as_ref().is_some_and(SeriesStore::is_live)
    }

    pub fn snapshot(&self) -> Option<SeriesSnapshot> {
        self.store.as_ref().map(SeriesStore::snapshot)
    }

    pub fn indicators(&self) -> Option<&Rc<IndicatorSet>> {
        self.pipeline.current()
    }

    pub fn shared_range(&self) -> Option<ViewRange> {
        self.sync.shared()
    }

    pub fn panes(&self) -> &PaneLifecycleManager<F> {
        &self.panes
    }

    pub fn pending_ticks(&self) -> usize {
        self.pending_ticks.len()
    }

    // ========================================================================
    // Opérations
    // ========================================================================

    /// Change de binding
    ///
    /// 1. Annule le fetch et l'abonnement en cours
    /// 2. Démonte les panneaux, détruit store + indicateurs
    /// 3. Crée un nouveau store, remonte les panneaux
    /// 4. Retourne le ticket que le runtime doit exécuter
    pub fn select(&mut self, binding: Binding) -> LoadTicket {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.teardown();

        self.token = RequestToken(self.token.0 + 1);
        let cancel = CancellationToken::new();
        self.cancel = Some(cancel.clone());

        let mut store = SeriesStore::new(binding.symbol.clone(), binding.resolution);
        self.pipeline_slot = SnapshotSlot::new();
        // Le pipeline est inscrit avant les panneaux : il voit chaque snapshot en premier
        store.on_change(self.pipeline_slot.listener());

        if let Err(e) = self.panes.mount_all(&binding, &mut store, &mut self.sync) {
            warn!(binding = %binding, error = %e, "Some panes could not be mounted");
        }

        self.store = Some(store);
        self.state = LoadState::Loading;
        info!(binding = %binding, token = self.token.0, "Session bound");
        self.binding = Some(binding.clone());

        LoadTicket {
            token: self.token,
            binding,
            cancel,
        }
    }

    /// Recharge le binding courant depuis zéro
    pub fn reload(&mut self) -> Option<LoadTicket> {
        let binding = self.binding.clone()?;
        Some(self.select(binding))
    }

    /// Ferme la session : annule les I/O et libère les panneaux
    pub fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.teardown();
        self.binding = None;
        self.state = LoadState::Idle;
    }

    fn teardown(&mut self) {
        match self.store.as_mut() {
            Some(store) => self.panes.unmount_all(store, &mut self.sync),
            None => self.panes.release_all(&mut self.sync),
        }
        self.store = None;
        self.pipeline.reset();
        self.sync.reset();
        self.pending_ticks.clear();
        self.last_open_time = None;
    }

    /// Réponse du HistoryLoader
    ///
    /// # Retourne
    /// * `Some(LoadTicket)` - la session a dû se réinitialiser (StaleSeed)
    /// * `None` - rien d'autre à faire
    pub fn on_history(
        &mut self,
        token: RequestToken,
        result: Result<HistorySeed, ChartError>,
    ) -> Option<LoadTicket> {
        if token != self.token || self.state != LoadState::Loading {
            self.stats.stale_responses += 1;
            debug!(token = token.0, current = self.token.0, "Stale history response discarded");
            return None;
        }
        let store = self.store.as_mut()?;

        let baseline = match result {
            Ok(seed) => match store.seed_history(seed.bars) {
                Ok(()) => {
                    self.state = LoadState::Ready;
                    seed.baseline
                }
                Err(ChartError::StaleSeed { symbol }) => {
                    warn!(%symbol, "Seed arrived after live data, reloading session");
                    self.stats.reloads += 1;
                    return self.reload();
                }
                Err(e) => {
                    warn!(error = %e, "History rejected");
                    self.state = LoadState::Unavailable(e.to_string());
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "History unavailable, showing live data only");
                self.state = LoadState::Unavailable(e.to_string());
                None
            }
        };

        // Ticks reçus pendant le chargement, dans l'ordre d'arrivée
        let buffered = std::mem::take(&mut self.pending_ticks);
        if !buffered.is_empty() {
            debug!(ticks = buffered.len(), "Replaying buffered ticks");
        }
        for tick in &buffered {
            self.apply(tick);
        }

        self.refresh();

        if let (Some(baseline), Some(indicators)) = (baseline, self.pipeline.current()) {
            if let Some(snapshot) = self.store.as_ref().map(SeriesStore::snapshot) {
                let divergences = self.pipeline.baseline_divergences(
                    indicators,
                    &snapshot,
                    &baseline,
                    self.options.baseline_tolerance,
                );
                for d in &divergences {
                    warn!(
                        indicator = %d.name,
                        open_time = d.open_time,
                        server = d.server,
                        local = d.local,
                        "Indicator diverges from server baseline"
                    );
                }
                if divergences.is_empty() {
                    debug!("Indicators agree with server baseline");
                }
            }
        }
        None
    }

    /// Tick reçu du flux
    pub fn on_tick(&mut self, token: RequestToken, tick: Tick) {
        if token != self.token {
            self.stats.stale_responses += 1;
            return;
        }

        match self.state {
            LoadState::Loading => {
                if self.pending_ticks.len() >= self.options.tick_buffer {
                    self.pending_ticks.pop_front();
                    self.stats.buffer_overflows += 1;
                }
                self.pending_ticks.push_back(tick);
                self.stats.buffered_ticks += 1;
            }
            LoadState::Ready | LoadState::Unavailable(_) => {
                if self.apply(&tick) {
                    self.refresh();
                }
            }
            LoadState::Idle => {}
        }
    }

    /// Applique un tick au store ; les rejets défensifs sont seulement comptés
    fn apply(&mut self, tick: &Tick) -> bool {
        let Some(store) = self.store.as_mut() else {
            return false;
        };
        match store.apply_tick(tick) {
            Ok(_) => true,
            Err(e) if e.is_defensive_drop() => {
                self.stats.defensive_drops += 1;
                false
            }
            Err(e) => {
                warn!(error = %e, "Tick rejected");
                false
            }
        }
    }

    /// Propage la dernière mutation : indicateurs, vue, panneaux
    fn refresh(&mut self) {
        if let Some(snapshot) = self.pipeline_slot.take() {
            self.pipeline.update(&snapshot);
            self.follow(&snapshot);
        }

        self.drain_ranges();

        if let Some(indicators) = self.pipeline.current() {
            let indicators = Rc::clone(indicators);
            self.panes.render_pending(&indicators);
        }
    }

    /// Cadrage initial puis suivi de la barre live
    fn follow(&mut self, snapshot: &SeriesSnapshot) {
        let Some(last) = snapshot.last_open_time() else {
            return;
        };

        match (self.sync.shared(), self.last_open_time) {
            (None, _) => {
                if let Some(range) = self.initial_range(snapshot) {
                    self.sync.broadcast(range);
                }
            }
            (Some(_), Some(previous)) if last > previous => {
                self.sync.follow(previous, last);
            }
            _ => {}
        }
        self.last_open_time = Some(last);
    }

    /// Les `visible_bars` dernières barres, barre courante incluse
    fn initial_range(&self, snapshot: &SeriesSnapshot) -> Option<ViewRange> {
        let first = snapshot
            .bars
            .len()
            .saturating_sub(self.options.visible_bars.max(1));
        let from = snapshot.bars.get(first)?.open_time;
        let to = snapshot
            .last_open_time()?
            .saturating_add(snapshot.resolution.seconds());
        ViewRange::new(from, to)
    }

    /// Changement de fenêtre par l'utilisateur sur un panneau
    ///
    /// Le panneau d'origine affiche déjà la fenêtre : seuls les autres la
    /// reçoivent. Une fenêtre identique à la fenêtre partagée (echo d'un
    /// `set_range`) n'est livrée à personne.
    pub fn on_range_change(&mut self, pane: PaneId, range: ViewRange) -> bool {
        if !self.sync.submit(pane, range) {
            return false;
        }
        self.drain_ranges();
        true
    }

    /// Fenêtre choisie hors des panneaux (clavier) : tous les panneaux la reçoivent
    pub fn set_range(&mut self, range: ViewRange) -> bool {
        if !self.sync.broadcast(range) {
            return false;
        }
        self.drain_ranges();
        true
    }

    fn drain_ranges(&mut self) {
        let panes = &mut self.panes;
        self.sync.drain(|id, r| panes.apply_range(id, r));
    }

    /// Redimensionne un panneau (sans changer son état)
    pub fn resize(&mut self, pane: PaneId, width: u16, height: u16) {
        self.panes.resize(pane, width, height);
    }
}

impl<F: PaneFactory> Drop for ChartSession<F> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

// ============================================================================
// Tests unitaires
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::pane::testing::{count, RecordingFactory};
    use crate::engine::pane::PaneState;

    const DAY: i64 = 86_400;

    fn session() -> ChartSession<RecordingFactory> {
        ChartSession::new(RecordingFactory::default(), SessionOptions::default())
    }

    fn seed(closes: &[f64]) -> HistorySeed {
        HistorySeed {
            bars: closes
                .iter()
                .enumerate()
                .map(|(i, &c)| Bar::new(i as i64 * DAY, c, c, c, c, 100.0))
                .collect(),
            baseline: None,
        }
    }

    #[test]
    fn test_binding_normalizes_symbol() {
        assert_eq!(Binding::new(" aapl ", Resolution::D1).symbol, "AAPL");
    }

    #[test]
    fn test_select_mounts_and_loads() {
        let mut session = session();
        let ticket = session.select(Binding::new("AAPL", Resolution::D1));

        assert_eq!(ticket.token, RequestToken(1));
        assert_eq!(session.state(), &LoadState::Loading);
        for id in session.panes().ids() {
            assert_eq!(session.panes().state(id), Some(PaneState::Bound));
        }
    }

    #[test]
    fn test_history_then_tick_renders_panes() {
        let mut session = session();
        let ticket = session.select(Binding::new("AAPL", Resolution::D1));
        session.on_history(ticket.token, Ok(seed(&[100.0, 102.0, 101.0, 105.0, 107.0])));
        assert_eq!(session.state(), &LoadState::Ready);

        session.on_tick(ticket.token, Tick::new("AAPL", 110.0, 5 * DAY));

        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.len(), 6);
        assert_eq!(session.indicators().unwrap().len(), 6);
        for (_, _, surface) in session.panes().surfaces() {
            assert_eq!(surface.last_revision, Some(snapshot.revision));
        }
    }

    #[test]
    fn test_rebind_cancels_and_ignores_stale_history() {
        let mut session = session();
        let first = session.select(Binding::new("AAPL", Resolution::D1));
        let second = session.select(Binding::new("TSLA", Resolution::D1));

        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());

        // Réponse tardive pour AAPL : ignorée
        session.on_history(first.token, Ok(seed(&[1.0, 2.0])));
        assert_eq!(session.state(), &LoadState::Loading);
        assert_eq!(session.stats().stale_responses, 1);

        session.on_history(second.token, Ok(seed(&[3.0, 4.0])));
        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.symbol, "TSLA");
        assert_eq!(snapshot.closes(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_rebind_releases_each_pane_once() {
        let mut session = session();
        session.select(Binding::new("AAPL", Resolution::D1));
        session.select(Binding::new("AAPL", Resolution::H1));

        let log = &session.panes().factory().log;
        assert_eq!(count(log, "acquire:"), 6);
        assert_eq!(count(log, "release:"), 3);
    }

    #[test]
    fn test_ticks_buffered_during_load_are_replayed() {
        let mut session = session();
        let ticket = session.select(Binding::new("AAPL", Resolution::D1));

        session.on_tick(ticket.token, Tick::new("AAPL", 110.0, 5 * DAY));
        session.on_tick(ticket.token, Tick::new("AAPL", 111.0, 5 * DAY + 60));
        assert_eq!(session.pending_ticks(), 2);
        assert!(session.snapshot().unwrap().is_empty());

        session.on_history(ticket.token, Ok(seed(&[100.0, 102.0, 101.0, 105.0, 107.0])));

        let snapshot = session.snapshot().unwrap();
        assert_eq!(session.pending_ticks(), 0);
        assert_eq!(snapshot.len(), 6);
        assert_eq!(snapshot.bars[5], Bar::new(5 * DAY, 110.0, 111.0, 110.0, 111.0, 0.0));
    }

    #[test]
    fn test_tick_buffer_is_bounded() {
        let options = SessionOptions {
            tick_buffer: 2,
            ..SessionOptions::default()
        };
        let mut session = ChartSession::new(RecordingFactory::default(), options);
        let ticket = session.select(Binding::new("AAPL", Resolution::M5));

        for i in 0..5 {
            session.on_tick(ticket.token, Tick::new("AAPL", 1.0 + i as f64, i * 10));
        }
        assert_eq!(session.pending_ticks(), 2);
        assert_eq!(session.stats().buffer_overflows, 3);
    }

    #[test]
    fn test_history_unavailable_keeps_live_ticks() {
        let mut session = session();
        let ticket = session.select(Binding::new("AAPL", Resolution::M5));
        let error = ChartError::HistoryUnavailable {
            symbol: "AAPL".to_string(),
            resolution: Resolution::M5,
            reason: "zero bars".to_string(),
        };
        session.on_history(ticket.token, Err(error));
        assert!(matches!(session.state(), LoadState::Unavailable(_)));

        session.on_tick(ticket.token, Tick::new("AAPL", 10.0, 0));
        assert_eq!(session.snapshot().unwrap().len(), 1);
        assert!(session.shared_range().is_some());
    }

    #[test]
    fn test_defensive_drops_are_counted_not_surfaced() {
        let mut session = session();
        let ticket = session.select(Binding::new("AAPL", Resolution::D1));
        session.on_history(ticket.token, Ok(seed(&[100.0, 101.0])));

        session.on_tick(ticket.token, Tick::new("TSLA", 5.0, DAY));
        session.on_tick(ticket.token, Tick::new("AAPL", 5.0, -DAY));

        assert_eq!(session.stats().defensive_drops, 2);
        assert_eq!(session.state(), &LoadState::Ready);
    }

    #[test]
    fn test_extreme_timestamps_do_not_panic() {
        let mut session = session();
        let ticket = session.select(Binding::new("AAPL", Resolution::D1));
        session.on_history(ticket.token, Ok(seed(&[1.0, 2.0, 3.0, 4.0, 5.0])));

        session.on_tick(ticket.token, Tick::new("AAPL", 5.0, i64::MIN));
        assert_eq!(session.stats().defensive_drops, 1);

        session.on_tick(ticket.token, Tick::new("AAPL", 6.0, i64::MAX));
        assert_eq!(session.snapshot().unwrap().len(), 6);
        assert!(session.shared_range().is_some());
    }

    #[test]
    fn test_initial_fit_and_auto_follow() {
        let options = SessionOptions {
            visible_bars: 3,
            ..SessionOptions::default()
        };
        let mut session = ChartSession::new(RecordingFactory::default(), options);
        let ticket = session.select(Binding::new("AAPL", Resolution::D1));
        session.on_history(ticket.token, Ok(seed(&[1.0, 2.0, 3.0, 4.0, 5.0])));

        assert_eq!(session.shared_range(), ViewRange::new(2 * DAY, 5 * DAY));
        for (_, _, surface) in session.panes().surfaces() {
            assert_eq!(surface.range, session.shared_range());
        }

        session.on_tick(ticket.token, Tick::new("AAPL", 6.0, 5 * DAY));
        assert_eq!(session.shared_range(), ViewRange::new(3 * DAY, 6 * DAY));
    }

    #[test]
    fn test_user_range_reaches_other_panes_only() {
        let mut session = session();
        let ticket = session.select(Binding::new("AAPL", Resolution::D1));
        session.on_history(ticket.token, Ok(seed(&[1.0, 2.0, 3.0])));

        let log = &session.panes().factory().log;
        let before = count(log, "range:");
        let range = ViewRange::new(0, DAY).unwrap();
        assert!(session.on_range_change(PaneId(0), range));

        let log = &session.panes().factory().log;
        // Les deux autres panneaux seulement
        assert_eq!(count(log, "range:") - before, 2);
        assert_eq!(session.shared_range(), Some(range));

        // Un panneau qui renvoie la fenêtre reçue ne relance rien
        for _ in 0..10 {
            assert!(session.on_range_change(PaneId(1), range));
            assert!(session.on_range_change(PaneId(0), range));
        }
        assert_eq!(count(&session.panes().factory().log, "range:") - before, 2);

        assert!(!session.on_range_change(PaneId(0), ViewRange { from: 5, to: 5 }));
    }

    #[test]
    fn test_set_range_reaches_every_pane_once() {
        let mut session = session();
        let ticket = session.select(Binding::new("AAPL", Resolution::D1));
        session.on_history(ticket.token, Ok(seed(&[1.0, 2.0, 3.0])));

        let before = count(&session.panes().factory().log, "range:");
        let range = ViewRange::new(DAY, 2 * DAY).unwrap();
        assert!(session.set_range(range));
        assert_eq!(count(&session.panes().factory().log, "range:") - before, 3);

        // Echo de chaque panneau : aucune livraison
        for id in session.panes().ids() {
            session.on_range_change(id, range);
        }
        assert_eq!(count(&session.panes().factory().log, "range:") - before, 3);
        assert!(!session.set_range(ViewRange { from: 9, to: 1 }));
    }

    #[test]
    fn test_close_releases_everything() {
        let mut session = session();
        let ticket = session.select(Binding::new("AAPL", Resolution::D1));
        session.close();

        assert!(ticket.cancel.is_cancelled());
        assert_eq!(session.state(), &LoadState::Idle);
        assert_eq!(count(&session.panes().factory().log, "release:"), 3);
    }
}
