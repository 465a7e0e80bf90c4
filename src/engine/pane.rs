// ============================================================================
// PaneLifecycleManager : création / destruction / redimensionnement des panneaux
// ============================================================================
// Machine à états d'un panneau :
//
//   Unmounted → Mounting → Bound → Unmounting → Unmounted
//
// - Mounting : acquisition d'une surface (conteneur + binding), puis
//   inscription auprès du store (listener) et du coordinateur de vue
// - Changement de binding : cycle complet unmount / mount
// - Unmount : listener, inscription de vue et surface libérés sur tous les
//   chemins (y compris Drop)
// - Resize : ne change pas l'état
//
// CONCEPTS RUST :
// 1. Trait avec type associé : PaneFactory::Surface (pas de Box<dyn>)
// 2. Drop : libération garantie de la surface
// 3. Générique : le moteur ne connaît pas le moteur de rendu
// ============================================================================

use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::engine::indicators::IndicatorSet;
use crate::engine::session::Binding;
use crate::engine::store::{ListenerId, SeriesSnapshot, SeriesStore, SnapshotSlot};
use crate::engine::view_sync::{PaneId, ViewSyncCoordinator};
use crate::error::ChartError;
use crate::models::ViewRange;

/// Type de panneau
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaneKind {
    /// Chandelles + moyennes mobiles + Bollinger
    Price,
    /// Volume
    Volume,
    /// RSI + MACD
    Oscillator,
}

impl PaneKind {
    /// Nom du conteneur de rendu
    pub fn container(&self) -> &'static str {
        match self {
            PaneKind::Price => "price",
            PaneKind::Volume => "volume",
            PaneKind::Oscillator => "oscillator",
        }
    }

    pub fn all() -> [PaneKind; 3] {
        [PaneKind::Price, PaneKind::Volume, PaneKind::Oscillator]
    }
}

/// État d'un emplacement de panneau
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneState {
    Unmounted,
    Mounting,
    Bound,
    Unmounting,
}

/// Données déclaratives remises à une surface pour le rendu
#[derive(Debug, Clone)]
pub struct PaneFrame {
    pub kind: PaneKind,
    pub snapshot: Rc<SeriesSnapshot>,
    pub indicators: Rc<IndicatorSet>,
}

/// Surface de rendu d'un panneau
///
/// N'expose jamais son état de dessin : elle reçoit des données et une fenêtre
pub trait PaneSurface {
    /// Nouvelles données à afficher
    fn render(&mut self, frame: &PaneFrame);

    /// Nouvelle fenêtre visible
    fn set_range(&mut self, range: ViewRange);

    /// Nouvelle taille du conteneur
    fn resize(&mut self, width: u16, height: u16);

    /// Libère les ressources ; appelé exactement une fois
    fn release(&mut self);
}

/// Fabrique de surfaces
pub trait PaneFactory {
    type Surface: PaneSurface;

    /// Acquiert une surface dans `container` pour `binding`
    fn acquire(
        &mut self,
        container: &str,
        binding: &Binding,
        kind: PaneKind,
    ) -> Result<Self::Surface, ChartError>;
}

/// Possède une surface montée et ses abonnements
pub struct PaneHandle<S: PaneSurface> {
    binding: Binding,
    surface: S,
    listener: ListenerId,
    slot: SnapshotSlot,
    released: bool,
}

impl<S: PaneSurface> PaneHandle<S> {
    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Libère la surface (idempotent)
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.surface.release();
        }
    }
}

impl<S: PaneSurface> Drop for PaneHandle<S> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Emplacement d'un panneau
struct PaneSlot<S: PaneSurface> {
    id: PaneId,
    kind: PaneKind,
    state: PaneState,
    size: Option<(u16, u16)>,
    handle: Option<PaneHandle<S>>,
}

/// Compteurs du gestionnaire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaneStats {
    pub mounts: u64,
    pub unmounts: u64,
    pub mount_failures: u64,
}

/// Gestionnaire du cycle de vie des panneaux d'une session
pub struct PaneLifecycleManager<F: PaneFactory> {
    factory: F,
    slots: Vec<PaneSlot<F::Surface>>,
    stats: PaneStats,
}

impl<F: PaneFactory> PaneLifecycleManager<F> {
    /// Crée un emplacement par type de panneau (ids 0, 1, 2, ...)
    pub fn new(factory: F, kinds: &[PaneKind]) -> Self {
        let slots = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| PaneSlot {
                id: PaneId(i as u32),
                kind: *kind,
                state: PaneState::Unmounted,
                size: None,
                handle: None,
            })
            .collect();

        Self {
            factory,
            slots,
            stats: PaneStats::default(),
        }
    }

    pub fn stats(&self) -> PaneStats {
        self.stats
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Identifiants des panneaux, dans l'ordre d'affichage
    pub fn ids(&self) -> Vec<PaneId> {
        self.slots.iter().map(|slot| slot.id).collect()
    }

    pub fn kind(&self, id: PaneId) -> Option<PaneKind> {
        self.slot(id).map(|slot| slot.kind)
    }

    pub fn state(&self, id: PaneId) -> Option<PaneState> {
        self.slot(id).map(|slot| slot.state)
    }

    /// Handle d'un panneau monté
    pub fn handle(&self, id: PaneId) -> Option<&PaneHandle<F::Surface>> {
        self.slot(id)?.handle.as_ref()
    }

    /// Surfaces montées avec leur type, dans l'ordre d'affichage
    pub fn surfaces(&self) -> impl Iterator<Item = (PaneId, PaneKind, &F::Surface)> {
        self.slots.iter().filter_map(|slot| {
            slot.handle
                .as_ref()
                .map(|handle| (slot.id, slot.kind, &handle.surface))
        })
    }

    fn slot(&self, id: PaneId) -> Option<&PaneSlot<F::Surface>> {
        self.slots.iter().find(|slot| slot.id == id)
    }

    fn slot_index(&self, id: PaneId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    /// Monte un panneau pour `binding`
    ///
    /// - Déjà lié au même binding : rien à faire
    /// - Lié à un autre binding : cycle complet unmount / mount
    /// - Échec d'acquisition : l'emplacement reste Unmounted
    pub fn mount(
        &mut self,
        id: PaneId,
        binding: &Binding,
        store: &mut SeriesStore,
        sync: &mut ViewSyncCoordinator,
    ) -> Result<(), ChartError> {
        let index = self.slot_index(id).ok_or_else(|| ChartError::PaneAcquisition {
            container: id.to_string(),
            reason: "unknown pane".to_string(),
        })?;

        if let Some(handle) = &self.slots[index].handle {
            if handle.binding == *binding {
                return Ok(());
            }
            self.unmount(id, store, sync);
        }

        let kind = self.slots[index].kind;
        self.slots[index].state = PaneState::Mounting;

        let mut surface = match self.factory.acquire(kind.container(), binding, kind) {
            Ok(surface) => surface,
            Err(e) => {
                self.slots[index].state = PaneState::Unmounted;
                self.stats.mount_failures += 1;
                warn!(%id, container = kind.container(), error = %e, "Pane mount failed");
                return Err(e);
            }
        };

        if let Some((width, height)) = self.slots[index].size {
            surface.resize(width, height);
        }
        if let Some(range) = sync.register(id) {
            surface.set_range(range);
        }

        let slot = SnapshotSlot::new();
        let listener = store.on_change(slot.listener());

        let pane = &mut self.slots[index];
        pane.handle = Some(PaneHandle {
            binding: binding.clone(),
            surface,
            listener,
            slot,
            released: false,
        });
        pane.state = PaneState::Bound;
        self.stats.mounts += 1;
        debug!(%id, container = kind.container(), symbol = %binding.symbol, "Pane bound");
        Ok(())
    }

    /// Monte tous les panneaux ; les échecs sont comptés, la première erreur est retournée
    pub fn mount_all(
        &mut self,
        binding: &Binding,
        store: &mut SeriesStore,
        sync: &mut ViewSyncCoordinator,
    ) -> Result<(), ChartError> {
        let mut first_error = None;
        for id in self.ids() {
            if let Err(e) = self.mount(id, binding, store, sync) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(symbol = %binding.symbol, resolution = %binding.resolution, "Panes mounted");
                Ok(())
            }
        }
    }

    /// Démonte un panneau : listener, vue et surface libérés
    pub fn unmount(&mut self, id: PaneId, store: &mut SeriesStore, sync: &mut ViewSyncCoordinator) {
        let Some(index) = self.slot_index(id) else {
            return;
        };
        let slot = &mut self.slots[index];
        let Some(mut handle) = slot.handle.take() else {
            slot.state = PaneState::Unmounted;
            return;
        };

        slot.state = PaneState::Unmounting;
        store.remove_listener(handle.listener);
        sync.unregister(id);
        handle.release();
        drop(handle);

        slot.state = PaneState::Unmounted;
        self.stats.unmounts += 1;
        debug!(%id, "Pane unmounted");
    }

    pub fn unmount_all(&mut self, store: &mut SeriesStore, sync: &mut ViewSyncCoordinator) {
        for id in self.ids() {
            self.unmount(id, store, sync);
        }
    }

    /// Libère les surfaces sans store (le store a déjà été détruit)
    pub fn release_all(&mut self, sync: &mut ViewSyncCoordinator) {
        for slot in &mut self.slots {
            if let Some(mut handle) = slot.handle.take() {
                slot.state = PaneState::Unmounting;
                sync.unregister(slot.id);
                handle.release();
                slot.state = PaneState::Unmounted;
                self.stats.unmounts += 1;
            }
        }
    }

    /// Redimensionne un panneau ; la taille est retenue pour les montages suivants
    pub fn resize(&mut self, id: PaneId, width: u16, height: u16) {
        if let Some(index) = self.slot_index(id) {
            let slot = &mut self.slots[index];
            if slot.size == Some((width, height)) {
                return;
            }
            slot.size = Some((width, height));
            if let Some(handle) = slot.handle.as_mut() {
                handle.surface.resize(width, height);
            }
        }
    }

    /// Applique une fenêtre à un panneau monté
    pub fn apply_range(&mut self, id: PaneId, range: ViewRange) {
        if let Some(index) = self.slot_index(id) {
            if let Some(handle) = self.slots[index].handle.as_mut() {
                handle.surface.set_range(range);
            }
        }
    }

    /// Rend chaque panneau ayant reçu un nouveau snapshot ; retourne le nombre de rendus
    pub fn render_pending(&mut self, indicators: &Rc<IndicatorSet>) -> usize {
        let mut rendered = 0;
        for slot in &mut self.slots {
            let Some(handle) = slot.handle.as_mut() else {
                continue;
            };
            if let Some(snapshot) = handle.slot.take() {
                let frame = PaneFrame {
                    kind: slot.kind,
                    snapshot,
                    indicators: Rc::clone(indicators),
                };
                handle.surface.render(&frame);
                rendered += 1;
            }
        }
        rendered
    }
}

// ============================================================================
// Fake de test partagé (moteur de rendu enregistreur)
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    pub type Log = Rc<RefCell<Vec<String>>>;

    /// Fabrique qui enregistre tous les appels
    #[derive(Default)]
    pub struct RecordingFactory {
        pub log: Log,
        pub fail_on: Option<PaneKind>,
    }

    pub struct RecordingSurface {
        pub container: String,
        pub log: Log,
        pub range: Option<ViewRange>,
        pub last_revision: Option<u64>,
    }

    impl PaneSurface for RecordingSurface {
        fn render(&mut self, frame: &PaneFrame) {
            self.last_revision = Some(frame.snapshot.revision);
            self.log
                .borrow_mut()
                .push(format!("render:{}:{}", self.container, frame.snapshot.revision));
        }

        fn set_range(&mut self, range: ViewRange) {
            self.range = Some(range);
            self.log
                .borrow_mut()
                .push(format!("range:{}:{}..{}", self.container, range.from, range.to));
        }

        fn resize(&mut self, width: u16, height: u16) {
            self.log
                .borrow_mut()
                .push(format!("resize:{}:{}x{}", self.container, width, height));
        }

        fn release(&mut self) {
            self.log.borrow_mut().push(format!("release:{}", self.container));
        }
    }

    impl PaneFactory for RecordingFactory {
        type Surface = RecordingSurface;

        fn acquire(
            &mut self,
            container: &str,
            binding: &Binding,
            kind: PaneKind,
        ) -> Result<RecordingSurface, ChartError> {
            if self.fail_on == Some(kind) {
                return Err(ChartError::PaneAcquisition {
                    container: container.to_string(),
                    reason: "container missing".to_string(),
                });
            }
            self.log.borrow_mut().push(format!(
                "acquire:{}:{}/{}",
                container, binding.symbol, binding.resolution
            ));
            Ok(RecordingSurface {
                container: container.to_string(),
                log: Rc::clone(&self.log),
                range: None,
                last_revision: None,
            })
        }
    }

    /// Compte les entrées du log qui commencent par `prefix`
    pub fn count(log: &Log, prefix: &str) -> usize {
        log.borrow().iter().filter(|entry| entry.starts_with(prefix)).count()
    }
}

// ============================================================================
// Tests unitaires
// ============================================================================

#[cfg(test)]
mod tests {
    use super::testing::{count, RecordingFactory};
    use super::*;
    use crate::models::{Resolution, Tick};

    fn binding(symbol: &str) -> Binding {
        Binding::new(symbol, Resolution::M5)
    }

    fn manager() -> PaneLifecycleManager<RecordingFactory> {
        PaneLifecycleManager::new(RecordingFactory::default(), &PaneKind::all())
    }

    #[test]
    fn test_mount_binds_and_subscribes() {
        let mut panes = manager();
        let mut store = SeriesStore::new("AAPL", Resolution::M5);
        let mut sync = ViewSyncCoordinator::new();

        panes.mount_all(&binding("AAPL"), &mut store, &mut sync).unwrap();

        for id in panes.ids() {
            assert_eq!(panes.state(id), Some(PaneState::Bound));
        }
        assert_eq!(store.listener_count(), 3);
        assert_eq!(sync.members().len(), 3);
        assert_eq!(count(&panes.factory().log, "acquire:"), 3);
    }

    #[test]
    fn test_unmount_releases_everything() {
        let mut panes = manager();
        let mut store = SeriesStore::new("AAPL", Resolution::M5);
        let mut sync = ViewSyncCoordinator::new();
        panes.mount_all(&binding("AAPL"), &mut store, &mut sync).unwrap();

        panes.unmount_all(&mut store, &mut sync);

        assert_eq!(store.listener_count(), 0);
        assert!(sync.members().is_empty());
        assert_eq!(count(&panes.factory().log, "release:"), 3);
        assert!(panes.surfaces().next().is_none());
        // Deuxième unmount : rien n'est libéré deux fois
        panes.unmount_all(&mut store, &mut sync);
        assert_eq!(count(&panes.factory().log, "release:"), 3);
    }

    #[test]
    fn test_binding_change_forces_full_cycle() {
        let mut panes = manager();
        let mut store = SeriesStore::new("AAPL", Resolution::M5);
        let mut sync = ViewSyncCoordinator::new();
        let id = PaneId(0);

        panes.mount(id, &binding("AAPL"), &mut store, &mut sync).unwrap();
        // Même binding : pas de remontage
        panes.mount(id, &binding("AAPL"), &mut store, &mut sync).unwrap();
        assert_eq!(count(&panes.factory().log, "acquire:"), 1);

        panes.mount(id, &binding("TSLA"), &mut store, &mut sync).unwrap();
        let log = panes.factory().log.borrow().clone();
        assert_eq!(
            log,
            vec![
                "acquire:price:AAPL/5m".to_string(),
                "release:price".to_string(),
                "acquire:price:TSLA/5m".to_string(),
            ]
        );
        assert_eq!(store.listener_count(), 1);
        assert_eq!(panes.handle(id).map(|h| h.binding().symbol.as_str()), Some("TSLA"));
    }

    #[test]
    fn test_mount_failure_leaves_slot_unmounted() {
        let factory = RecordingFactory {
            fail_on: Some(PaneKind::Volume),
            ..RecordingFactory::default()
        };
        let mut panes = PaneLifecycleManager::new(factory, &PaneKind::all());
        let mut store = SeriesStore::new("AAPL", Resolution::M5);
        let mut sync = ViewSyncCoordinator::new();

        let result = panes.mount_all(&binding("AAPL"), &mut store, &mut sync);

        assert!(matches!(result, Err(ChartError::PaneAcquisition { .. })));
        assert_eq!(panes.state(PaneId(1)), Some(PaneState::Unmounted));
        assert_eq!(panes.state(PaneId(0)), Some(PaneState::Bound));
        assert_eq!(panes.state(PaneId(2)), Some(PaneState::Bound));
        assert_eq!(store.listener_count(), 2);
        assert_eq!(panes.stats().mount_failures, 1);
    }

    #[test]
    fn test_resize_keeps_state_and_is_remembered() {
        let mut panes = manager();
        let mut store = SeriesStore::new("AAPL", Resolution::M5);
        let mut sync = ViewSyncCoordinator::new();
        let id = PaneId(2);

        panes.resize(id, 80, 20);
        panes.mount(id, &binding("AAPL"), &mut store, &mut sync).unwrap();
        panes.resize(id, 100, 30);
        panes.resize(id, 100, 30);

        assert_eq!(panes.state(id), Some(PaneState::Bound));
        let log = panes.factory().log.borrow().clone();
        assert_eq!(
            log[1..],
            [
                "resize:oscillator:80x20".to_string(),
                "resize:oscillator:100x30".to_string(),
            ]
        );
    }

    #[test]
    fn test_render_pending_uses_latest_snapshot() {
        let mut panes = manager();
        let mut store = SeriesStore::new("AAPL", Resolution::M5);
        let mut sync = ViewSyncCoordinator::new();
        panes.mount_all(&binding("AAPL"), &mut store, &mut sync).unwrap();

        store.apply_tick(&Tick::new("AAPL", 1.0, 0)).unwrap();
        store.apply_tick(&Tick::new("AAPL", 2.0, 10)).unwrap();

        let indicators = Rc::new(IndicatorSet::default());
        assert_eq!(panes.render_pending(&indicators), 3);
        assert_eq!(panes.render_pending(&indicators), 0);
        for (_, _, surface) in panes.surfaces() {
            assert_eq!(surface.last_revision, Some(2));
        }
    }

    #[test]
    fn test_drop_releases_surfaces() {
        let log = {
            let mut panes = manager();
            let mut store = SeriesStore::new("AAPL", Resolution::M5);
            let mut sync = ViewSyncCoordinator::new();
            panes.mount_all(&binding("AAPL"), &mut store, &mut sync).unwrap();
            Rc::clone(&panes.factory().log)
        };
        assert_eq!(count(&log, "release:"), 3);
    }
}
