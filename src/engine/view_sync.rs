// ============================================================================
// ViewSyncCoordinator : fenêtre visible partagée entre les panneaux
// ============================================================================
// Une seule ViewRange par session
//
// RÈGLES :
// - Un changement venant d'un panneau met à jour la fenêtre partagée et est
//   poussé à tous les AUTRES panneaux, jamais au panneau d'origine
// - Une fenêtre identique à la fenêtre partagée est absorbée (pas d'écho)
// - Les notifications sont traitées dans l'ordre d'arrivée (file FIFO)
// - Les fenêtres venant du moteur (cadrage initial, suivi de la barre live)
//   sont diffusées à tous les panneaux
// ============================================================================

use std::collections::VecDeque;
use std::fmt;

use tracing::{debug, trace};

use crate::models::ViewRange;

/// Identifiant d'un panneau dans une session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaneId(pub u32);

impl fmt::Display for PaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pane#{}", self.0)
    }
}

/// Origine d'un changement de fenêtre
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOrigin {
    /// Interaction utilisateur sur un panneau
    Pane(PaneId),

    /// Moteur (cadrage initial, auto-follow)
    Engine,
}

/// Compteurs de synchronisation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub accepted: u64,
    pub echoes: u64,
    pub rejected: u64,
    pub deliveries: u64,
}

/// Coordinateur de la fenêtre visible d'une session
#[derive(Debug, Default)]
pub struct ViewSyncCoordinator {
    shared: Option<ViewRange>,
    members: Vec<PaneId>,
    queue: VecDeque<(RangeOrigin, ViewRange)>,
    stats: SyncStats,
}

impl ViewSyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fenêtre partagée courante
    pub fn shared(&self) -> Option<ViewRange> {
        self.shared
    }

    pub fn members(&self) -> &[PaneId] {
        &self.members
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Nombre de notifications en attente
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Inscrit un panneau ; retourne la fenêtre partagée à appliquer tout de suite
    pub fn register(&mut self, pane: PaneId) -> Option<ViewRange> {
        if !self.members.contains(&pane) {
            self.members.push(pane);
            trace!(%pane, "Pane joined view sync");
        }
        self.shared
    }

    /// Désinscrit un panneau ; il ne reçoit plus rien, même déjà en file
    pub fn unregister(&mut self, pane: PaneId) -> bool {
        let before = self.members.len();
        self.members.retain(|member| *member != pane);
        self.members.len() != before
    }

    /// Oublie la fenêtre et la file (changement de binding)
    pub fn reset(&mut self) {
        self.shared = None;
        self.queue.clear();
    }

    /// Changement de fenêtre initié par l'utilisateur sur `origin`
    ///
    /// # Retourne
    /// * `true` - notification mise en file
    /// * `false` - fenêtre vide (from >= to), rejetée
    pub fn submit(&mut self, origin: PaneId, range: ViewRange) -> bool {
        self.enqueue(RangeOrigin::Pane(origin), range)
    }

    /// Fenêtre imposée par le moteur, diffusée à tous les panneaux
    pub fn broadcast(&mut self, range: ViewRange) -> bool {
        self.enqueue(RangeOrigin::Engine, range)
    }

    fn enqueue(&mut self, origin: RangeOrigin, range: ViewRange) -> bool {
        if range.from >= range.to {
            self.stats.rejected += 1;
            debug!(from = range.from, to = range.to, "Empty view range rejected");
            return false;
        }
        self.queue.push_back((origin, range));
        true
    }

    /// Traite la file dans l'ordre d'arrivée
    ///
    /// `apply(pane, range)` est appelé pour chaque panneau à mettre à jour.
    /// Retourne le nombre de livraisons effectuées.
    pub fn drain<A>(&mut self, mut apply: A) -> usize
    where
        A: FnMut(PaneId, ViewRange),
    {
        let mut delivered = 0;
        while let Some((origin, range)) = self.queue.pop_front() {
            if self.shared == Some(range) {
                self.stats.echoes += 1;
                trace!(?origin, "View range echo absorbed");
                continue;
            }

            self.shared = Some(range);
            self.stats.accepted += 1;

            for member in &self.members {
                if origin == RangeOrigin::Pane(*member) {
                    continue;
                }
                apply(*member, range);
                delivered += 1;
            }
        }
        self.stats.deliveries += delivered as u64;
        delivered
    }

    /// Auto-follow de la barre live
    ///
    /// Si la fenêtre partagée contient l'ancienne dernière barre, elle est
    /// décalée de l'écart entre l'ancienne et la nouvelle barre (un bucket
    /// quand la série est continue) puis diffusée.
    pub fn follow(&mut self, previous_last: i64, new_last: i64) -> Option<ViewRange> {
        let shared = self.shared?;
        if new_last <= previous_last || !shared.contains(previous_last) {
            return None;
        }
        let next = shared.shifted(new_last.saturating_sub(previous_last));
        self.broadcast(next);
        Some(next)
    }
}

// ============================================================================
// Tests unitaires
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const A: PaneId = PaneId(0);
    const B: PaneId = PaneId(1);
    const C: PaneId = PaneId(2);

    fn range(from: i64, to: i64) -> ViewRange {
        ViewRange { from, to }
    }

    fn coordinator() -> ViewSyncCoordinator {
        let mut sync = ViewSyncCoordinator::new();
        for pane in [A, B, C] {
            sync.register(pane);
        }
        sync
    }

    fn drain_log(sync: &mut ViewSyncCoordinator) -> Vec<(PaneId, ViewRange)> {
        let mut log = Vec::new();
        sync.drain(|pane, r| log.push((pane, r)));
        log
    }

    #[test]
    fn test_user_change_skips_origin() {
        let mut sync = coordinator();
        assert!(sync.submit(A, range(0, 100)));

        let log = drain_log(&mut sync);
        assert_eq!(log, vec![(B, range(0, 100)), (C, range(0, 100))]);
        assert_eq!(sync.shared(), Some(range(0, 100)));
    }

    #[test]
    fn test_echo_is_absorbed() {
        let mut sync = coordinator();
        sync.submit(A, range(0, 100));
        drain_log(&mut sync);

        // B et C renvoient la fenêtre qu'ils viennent de recevoir
        sync.submit(B, range(0, 100));
        sync.submit(C, range(0, 100));
        assert!(drain_log(&mut sync).is_empty());
        assert_eq!(sync.stats().echoes, 2);
    }

    #[test]
    fn test_arrival_order_last_wins() {
        let mut sync = coordinator();
        sync.submit(A, range(0, 100));
        sync.submit(B, range(50, 150));

        let log = drain_log(&mut sync);
        assert_eq!(
            log,
            vec![
                (B, range(0, 100)),
                (C, range(0, 100)),
                (A, range(50, 150)),
                (C, range(50, 150)),
            ]
        );
        assert_eq!(sync.shared(), Some(range(50, 150)));
    }

    #[test]
    fn test_empty_range_rejected() {
        let mut sync = coordinator();
        assert!(!sync.submit(A, range(100, 100)));
        assert!(!sync.broadcast(range(200, 100)));
        assert_eq!(sync.pending(), 0);
        assert_eq!(sync.stats().rejected, 2);
    }

    #[test]
    fn test_engine_broadcast_reaches_everyone() {
        let mut sync = coordinator();
        sync.broadcast(range(0, 10));
        let panes: Vec<PaneId> = drain_log(&mut sync).into_iter().map(|(p, _)| p).collect();
        assert_eq!(panes, vec![A, B, C]);
    }

    #[test]
    fn test_unregistered_pane_receives_nothing() {
        let mut sync = coordinator();
        sync.submit(A, range(0, 100));
        assert!(sync.unregister(C));
        assert!(!sync.unregister(C));

        assert_eq!(drain_log(&mut sync), vec![(B, range(0, 100))]);
        // Un nouveau membre reçoit la fenêtre partagée à l'inscription
        assert_eq!(sync.register(C), Some(range(0, 100)));
    }

    #[test]
    fn test_follow_shifts_when_last_bar_visible() {
        let mut sync = coordinator();
        sync.broadcast(range(0, 600));
        drain_log(&mut sync);

        assert_eq!(sync.follow(300, 600), Some(range(300, 900)));
        assert_eq!(drain_log(&mut sync).len(), 3);

        // Fenêtre déplacée dans le passé : pas de suivi
        sync.submit(A, range(0, 200));
        drain_log(&mut sync);
        assert_eq!(sync.follow(600, 900), None);
    }
}
