// ============================================================================
// SeriesStore : source de vérité d'une série (symbole, résolution)
// ============================================================================
// Contient l'historique scellé + la barre courante (encore ouverte)
//
// RÈGLE DE BUCKETING :
// - bucket = floor(timestamp / résolution) * résolution
// - bucket == barre courante : mise à jour (high, low, close, volume)
// - bucket > barre courante : la barre courante est scellée, nouvelle barre
// - bucket < barre courante : tick en retard, rejeté (l'historique n'est
//   jamais réécrit)
//
// CONCEPTS RUST :
// 1. Box<dyn FnMut> : listeners stockés comme closures
// 2. Rc : un seul snapshot partagé entre tous les listeners (mono-thread)
// 3. Result : chaque rejet est signalé par une ChartError typée
// ============================================================================

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::error::ChartError;
use crate::models::{Bar, Resolution, Tick};

/// Vue immuable de la série à un instant donné
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    pub symbol: String,
    pub resolution: Resolution,

    /// Barres ordonnées ; la dernière est la barre courante si `has_current`
    pub bars: Vec<Bar>,

    /// Nombre de barres scellées (historique immuable)
    pub sealed: usize,

    /// Incrémenté à chaque mutation du store
    pub revision: u64,

    /// Vrai dès qu'un tick live a été appliqué
    pub live: bool,
}

impl SeriesSnapshot {
    /// Vrai si la dernière barre est encore ouverte
    pub fn has_current(&self) -> bool {
        self.bars.len() > self.sealed
    }

    /// Barre courante (encore ouverte)
    pub fn current(&self) -> Option<&Bar> {
        if self.has_current() {
            self.bars.last()
        } else {
            None
        }
    }

    /// Prix de clôture, alignés 1:1 avec les barres
    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// open_time de la dernière barre
    pub fn last_open_time(&self) -> Option<i64> {
        self.bars.last().map(|b| b.open_time)
    }
}

/// Listener notifié à chaque mutation, dans l'ordre d'enregistrement
pub type ChangeListener = Box<dyn FnMut(&Rc<SeriesSnapshot>)>;

/// Identifiant d'un listener (pour le désabonnement)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Boîte aux lettres "dernier snapshot" d'un consommateur
///
/// CONCEPT : Mailbox
/// - Le listener écrit le snapshot le plus récent dans la boîte
/// - Le consommateur le récupère plus tard avec take()
/// - Chaque livraison remplace la précédente (jamais de réordonnancement)
#[derive(Debug, Clone, Default)]
pub struct SnapshotSlot(Rc<RefCell<Option<Rc<SeriesSnapshot>>>>);

impl SnapshotSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crée le listener à enregistrer sur le store
    pub fn listener(&self) -> ChangeListener {
        let slot = Rc::clone(&self.0);
        Box::new(move |snapshot: &Rc<SeriesSnapshot>| {
            *slot.borrow_mut() = Some(Rc::clone(snapshot));
        })
    }

    /// Récupère (et vide) le dernier snapshot livré
    pub fn take(&self) -> Option<Rc<SeriesSnapshot>> {
        self.0.borrow_mut().take()
    }

    /// Vrai si un snapshot attend d'être consommé
    pub fn is_pending(&self) -> bool {
        self.0.borrow().is_some()
    }
}

/// Résultat d'un tick accepté
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// La barre courante a été mise à jour
    Updated,

    /// Une nouvelle barre a été ouverte ; `sealed` est la barre scellée
    Opened { sealed: Option<Bar> },
}

/// Compteurs d'observabilité
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub ticks_applied: u64,
    pub bars_sealed: u64,
    pub late_dropped: u64,
    pub symbol_mismatches: u64,
}

/// Store d'une série (symbole, résolution)
pub struct SeriesStore {
    symbol: String,
    resolution: Resolution,
    history: Vec<Bar>,
    current: Option<Bar>,
    live: bool,
    revision: u64,
    listeners: Vec<(ListenerId, ChangeListener)>,
    next_listener: u64,
    stats: StoreStats,
}

impl SeriesStore {
    /// Crée un store vide lié à un symbole et une résolution
    pub fn new(symbol: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            symbol: symbol.into(),
            resolution,
            history: Vec::new(),
            current: None,
            live: false,
            revision: 0,
            listeners: Vec::new(),
            next_listener: 0,
            stats: StoreStats::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    /// Vrai dès qu'un tick live a établi une barre
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Enregistre un listener ; il reçoit chaque snapshot de manière synchrone
    pub fn on_change(&mut self, listener: ChangeListener) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Désabonne un listener ; retourne false s'il était inconnu
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Construit le snapshot courant
    pub fn snapshot(&self) -> SeriesSnapshot {
        let mut bars = Vec::with_capacity(self.history.len() + 1);
        bars.extend_from_slice(&self.history);
        if let Some(current) = self.current {
            bars.push(current);
        }

        SeriesSnapshot {
            symbol: self.symbol.clone(),
            resolution: self.resolution,
            bars,
            sealed: self.history.len(),
            revision: self.revision,
            live: self.live,
        }
    }

    /// Injecte l'historique
    ///
    /// - Refusé (StaleSeed) si une barre live existe déjà
    /// - Les open_time sont alignés sur la résolution, triés, dédoublonnés
    ///   (la dernière occurrence gagne)
    /// - La dernière barre devient la barre courante (peut être encore ouverte)
    pub fn seed_history(&mut self, bars: Vec<Bar>) -> Result<(), ChartError> {
        if self.live {
            warn!(symbol = %self.symbol, "History seed after live data, rejecting");
            return Err(ChartError::StaleSeed {
                symbol: self.symbol.clone(),
            });
        }

        let mut normalized = Vec::with_capacity(bars.len());
        for mut bar in bars {
            bar.validate()?;
            bar.open_time = self.resolution.bucket_start(bar.open_time);
            normalized.push(bar);
        }

        // Tri stable : à open_time égal, l'ordre d'arrivée est conservé
        normalized.sort_by_key(|b| b.open_time);

        let mut deduped: Vec<Bar> = Vec::with_capacity(normalized.len());
        for bar in normalized {
            match deduped.last_mut() {
                Some(last) if last.open_time == bar.open_time => *last = bar,
                _ => deduped.push(bar),
            }
        }

        self.current = deduped.pop();
        self.history = deduped;

        debug!(
            symbol = %self.symbol,
            resolution = %self.resolution,
            bars = self.history.len() + usize::from(self.current.is_some()),
            "Seeded series history"
        );
        self.commit();
        Ok(())
    }

    /// Applique un tick live
    ///
    /// # Retourne
    /// * `Ok(TickOutcome)` - tick intégré
    /// * `Err(SymbolMismatch)` - symbole étranger, store inchangé
    /// * `Err(LateTickDropped)` - bucket antérieur à la barre courante
    pub fn apply_tick(&mut self, tick: &Tick) -> Result<TickOutcome, ChartError> {
        if tick.symbol != self.symbol {
            self.stats.symbol_mismatches += 1;
            debug!(expected = %self.symbol, received = %tick.symbol, "Symbol mismatch, tick ignored");
            return Err(ChartError::SymbolMismatch {
                expected: self.symbol.clone(),
                received: tick.symbol.clone(),
            });
        }

        let bucket = self.resolution.bucket_start(tick.timestamp);
        let volume = tick.volume.unwrap_or(0.0);

        let current_open = self.current.map(|bar| bar.open_time);
        let outcome = match current_open {
            Some(open_time) if bucket == open_time => {
                if let Some(current) = self.current.as_mut() {
                    current.absorb(tick.price, volume);
                }
                TickOutcome::Updated
            }
            Some(open_time) if bucket < open_time => {
                self.stats.late_dropped += 1;
                debug!(
                    symbol = %self.symbol,
                    bucket,
                    current = open_time,
                    "Late tick dropped"
                );
                return Err(ChartError::LateTickDropped {
                    bucket,
                    current: open_time,
                });
            }
            _ => {
                let sealed = self.current.take();
                if let Some(bar) = sealed {
                    self.history.push(bar);
                    self.stats.bars_sealed += 1;
                }
                self.current = Some(Bar::from_price(bucket, tick.price, volume));
                TickOutcome::Opened { sealed }
            }
        };

        self.live = true;
        self.stats.ticks_applied += 1;
        trace!(symbol = %self.symbol, price = tick.price, bucket, "Tick applied");
        self.commit();
        Ok(outcome)
    }

    /// Incrémente la révision et notifie les listeners (ordre d'enregistrement)
    fn commit(&mut self) {
        self.revision += 1;
        if self.listeners.is_empty() {
            return;
        }

        let snapshot = Rc::new(self.snapshot());
        for (_, listener) in self.listeners.iter_mut() {
            listener(&snapshot);
        }
    }
}

// ============================================================================
// Tests unitaires
// ============================================================================
