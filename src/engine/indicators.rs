// ============================================================================
// IndicatorPipeline : séries dérivées (moyennes, oscillateurs, bandes)
// ============================================================================
// Calcule un IndicatorSet aligné 1:1 avec les barres de la série
// (barre courante incluse)
//
// RÈGLES :
// - Avant la fenêtre de lookback, la valeur est absente (None), jamais 0
// - recompute() est une fonction pure de la séquence complète de barres
// - update() choisit : mise à jour de la queue si seule la barre courante a
//   changé, sinon recalcul complet (obligatoire quand l'historique change)
// - La mise à jour de queue utilise exactement les mêmes opérations que le
//   recalcul complet : les deux chemins donnent des valeurs identiques
//
// ALGORITHMES :
// - SMA(n)  : moyenne arithmétique des n dernières clôtures
// - EMA(n)  : seed = SMA(n) à l'index n-1, puis close*k + ema*(1-k), k = 2/(n+1)
// - RSI(n)  : lissage de Wilder ; perte moyenne nulle => RSI = 100
// - MACD    : EMA(12) - EMA(26), signal = EMA(9) du MACD, histogramme = écart
// - Bollinger(n, k) : SMA(n) ± k * écart-type de population
// ============================================================================

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::engine::store::SeriesSnapshot;
use crate::models::Resolution;

/// Une colonne d'indicateur : None = pas encore calculable (affiché comme un trou)
pub type Column = Vec<Option<f64>>;

pub const MACD: &str = "macd";
pub const MACD_SIGNAL: &str = "macd_signal";
pub const MACD_HISTOGRAM: &str = "macd_histogram";
pub const BOLLINGER_UPPER: &str = "bollinger_upper";
pub const BOLLINGER_MIDDLE: &str = "bollinger_middle";
pub const BOLLINGER_LOWER: &str = "bollinger_lower";

const MACD_FAST_EMA: &str = "macd_fast_ema";
const MACD_SLOW_EMA: &str = "macd_slow_ema";

/// Paramètres des indicateurs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub sma_period: usize,
    pub ema_periods: Vec<usize>,
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bollinger_period: usize,
    pub bollinger_k: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            sma_period: 20,
            ema_periods: vec![20, 50],
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bollinger_period: 20,
            bollinger_k: 2.0,
        }
    }
}

impl IndicatorConfig {
    /// Vérifie les périodes (toutes > 0, MACD rapide < lente)
    pub fn validate(&self) -> Result<(), String> {
        let periods = [
            ("sma_period", self.sma_period),
            ("rsi_period", self.rsi_period),
            ("macd_fast", self.macd_fast),
            ("macd_slow", self.macd_slow),
            ("macd_signal", self.macd_signal),
            ("bollinger_period", self.bollinger_period),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, p)| *p == 0) {
            return Err(format!("{} must be greater than 0", name));
        }
        if self.ema_periods.iter().any(|p| *p == 0) {
            return Err("ema_periods must be greater than 0".to_string());
        }
        if self.macd_fast >= self.macd_slow {
            return Err("macd_fast must be smaller than macd_slow".to_string());
        }
        if !self.bollinger_k.is_finite() || self.bollinger_k < 0.0 {
            return Err("bollinger_k must be a positive number".to_string());
        }
        Ok(())
    }

    pub fn sma_name(&self) -> String {
        format!("sma{}", self.sma_period)
    }

    pub fn ema_name(period: usize) -> String {
        format!("ema{}", period)
    }

    pub fn rsi_name(&self) -> String {
        format!("rsi{}", self.rsi_period)
    }

    /// Périodes EMA sans doublons, dans l'ordre de configuration
    fn unique_ema_periods(&self) -> Vec<usize> {
        let mut periods: Vec<usize> = Vec::new();
        for p in &self.ema_periods {
            if !periods.contains(p) {
                periods.push(*p);
            }
        }
        periods
    }
}

/// Ensemble d'indicateurs aligné sur une série
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorSet {
    columns: BTreeMap<String, Column>,
    /// Colonnes intermédiaires (EMA du MACD), non exposées
    aux: BTreeMap<String, Column>,
    /// Moyennes de Wilder (gain, perte) par index, pour la mise à jour de queue
    wilder: Vec<Option<(f64, f64)>>,
    len: usize,
}

impl IndicatorSet {
    /// Nombre de valeurs par colonne (= nombre de barres)
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Colonne par nom ("sma20", "rsi14", "macd", ...)
    pub fn get(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Valeur à un index ; None si absente ou hors fenêtre de lookback
    pub fn value_at(&self, name: &str, index: usize) -> Option<f64> {
        self.columns.get(name)?.get(index).copied().flatten()
    }

    /// Dernière valeur (barre courante)
    pub fn latest(&self, name: &str) -> Option<f64> {
        self.value_at(name, self.len.checked_sub(1)?)
    }

    /// Noms des colonnes, triés
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }
}

/// Valeurs précalculées par le collaborateur REST, alignées sur `dates`
///
/// Noms fixés par le serveur : sma, ema, rsi, macd, bollinger_upper, bollinger_lower
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorBaseline {
    pub dates: Vec<i64>,
    pub columns: BTreeMap<String, Column>,
}

/// Écart entre une valeur serveur et la valeur locale
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineDivergence {
    pub name: String,
    pub open_time: i64,
    pub server: f64,
    pub local: f64,
}

// ============================================================================
// Fonctions de calcul (pures)
// ============================================================================

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Moyenne et écart-type de population d'une fenêtre
fn window_stats(window: &[f64]) -> (f64, f64) {
    let m = mean(window);
    let variance = window.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / window.len() as f64;
    (m, variance.sqrt())
}

/// Fenêtre [index+1-n, index] si elle existe
fn trailing(values: &[f64], index: usize, n: usize) -> Option<&[f64]> {
    if n == 0 || index + 1 < n || index >= values.len() {
        return None;
    }
    Some(&values[index + 1 - n..=index])
}

fn ema_step(value: f64, previous: f64, k: f64) -> f64 {
    value * k + previous * (1.0 - k)
}

fn wilder_step(average: f64, value: f64, n: usize) -> f64 {
    (average * (n as f64 - 1.0) + value) / n as f64
}

/// RSI à partir des moyennes ; perte moyenne nulle => 100
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// (gain, perte) entre la clôture index-1 et index
fn change_at(closes: &[f64], index: usize) -> (f64, f64) {
    let change = closes[index] - closes[index - 1];
    if change > 0.0 {
        (change, 0.0)
    } else {
        (0.0, -change)
    }
}

/// Moyennes de Wilder initiales (index n) : moyennes simples des n premières variations
fn wilder_seed(closes: &[f64], n: usize) -> (f64, f64) {
    let (gains, losses) = (1..=n).fold((0.0, 0.0), |(g, l), i| {
        let (gain, loss) = change_at(closes, i);
        (g + gain, l + loss)
    });
    (gains / n as f64, losses / n as f64)
}

/// SMA(n) sur toute la série
pub fn sma(closes: &[f64], n: usize) -> Column {
    (0..closes.len())
        .map(|i| trailing(closes, i, n).map(mean))
        .collect()
}

/// EMA(n) d'une colonne dont les valeurs définies sont contiguës
///
/// Le seed est la moyenne des n premières valeurs définies
pub fn ema_column(values: &[Option<f64>], n: usize) -> Column {
    let mut out = vec![None; values.len()];
    if n == 0 {
        return out;
    }
    let Some(start) = values.iter().position(Option::is_some) else {
        return out;
    };
    let seed_index = start + n - 1;
    if seed_index >= values.len() {
        return out;
    }
    let Some(window) = values[start..=seed_index].iter().copied().collect::<Option<Vec<f64>>>()
    else {
        return out;
    };

    let k = 2.0 / (n as f64 + 1.0);
    let mut previous = mean(&window);
    out[seed_index] = Some(previous);
    for i in seed_index + 1..values.len() {
        match values[i] {
            Some(value) => {
                previous = ema_step(value, previous, k);
                out[i] = Some(previous);
            }
            None => break,
        }
    }
    out
}

/// EMA(n) des clôtures
pub fn ema(closes: &[f64], n: usize) -> Column {
    let values: Column = closes.iter().copied().map(Some).collect();
    ema_column(&values, n)
}

/// RSI(n) + moyennes de Wilder par index
fn rsi_with_state(closes: &[f64], n: usize) -> (Column, Vec<Option<(f64, f64)>>) {
    let mut out = vec![None; closes.len()];
    let mut state = vec![None; closes.len()];
    if n == 0 || closes.len() <= n {
        return (out, state);
    }

    let (mut avg_gain, mut avg_loss) = wilder_seed(closes, n);
    out[n] = Some(rsi_from_averages(avg_gain, avg_loss));
    state[n] = Some((avg_gain, avg_loss));

    for i in n + 1..closes.len() {
        let (gain, loss) = change_at(closes, i);
        avg_gain = wilder_step(avg_gain, gain, n);
        avg_loss = wilder_step(avg_loss, loss, n);
        out[i] = Some(rsi_from_averages(avg_gain, avg_loss));
        state[i] = Some((avg_gain, avg_loss));
    }
    (out, state)
}

/// RSI(n) avec lissage de Wilder
pub fn rsi(closes: &[f64], n: usize) -> Column {
    rsi_with_state(closes, n).0
}

/// Bandes de Bollinger : (upper, middle, lower)
pub fn bollinger(closes: &[f64], n: usize, k: f64) -> (Column, Column, Column) {
    let mut upper = Vec::with_capacity(closes.len());
    let mut middle = Vec::with_capacity(closes.len());
    let mut lower = Vec::with_capacity(closes.len());
    for i in 0..closes.len() {
        match trailing(closes, i, n).map(window_stats) {
            Some((m, sd)) => {
                upper.push(Some(m + k * sd));
                middle.push(Some(m));
                lower.push(Some(m - k * sd));
            }
            None => {
                upper.push(None);
                middle.push(None);
                lower.push(None);
            }
        }
    }
    (upper, middle, lower)
}

fn difference(a: &[Option<f64>], b: &[Option<f64>]) -> Column {
    a.iter()
        .zip(b)
        .map(|(x, y)| match (x, y) {
            (Some(x), Some(y)) => Some(x - y),
            _ => None,
        })
        .collect()
}

/// Valeur EMA au dernier index, à partir de la colonne précédente
///
/// Mêmes opérations que ema_column : le résultat est identique au recalcul
fn ema_tail(values: &[Option<f64>], previous: &[Option<f64>], n: usize) -> Option<f64> {
    if n == 0 {
        return None;
    }
    let index = values.len().checked_sub(1)?;
    let start = values.iter().position(Option::is_some)?;
    let seed_index = start + n - 1;
    if index < seed_index {
        return None;
    }
    if index == seed_index {
        let window = values[start..=seed_index]
            .iter()
            .copied()
            .collect::<Option<Vec<f64>>>()?;
        return Some(mean(&window));
    }
    let k = 2.0 / (n as f64 + 1.0);
    let prev = previous.get(index - 1).copied().flatten()?;
    Some(ema_step(values[index]?, prev, k))
}

fn set_last(column: &mut Column, value: Option<f64>) {
    if let Some(slot) = column.last_mut() {
        *slot = value;
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Identité d'une série pour décider entre queue et recalcul complet
#[derive(Debug, Clone, PartialEq)]
struct SeriesKey {
    symbol: String,
    resolution: Resolution,
    len: usize,
    sealed: usize,
    first_open_time: Option<i64>,
}

impl SeriesKey {
    fn of(snapshot: &SeriesSnapshot) -> Self {
        Self {
            symbol: snapshot.symbol.clone(),
            resolution: snapshot.resolution,
            len: snapshot.len(),
            sealed: snapshot.sealed,
            first_open_time: snapshot.bars.first().map(|b| b.open_time),
        }
    }
}

/// Compteurs du pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub full_recomputes: u64,
    pub tail_updates: u64,
}

/// Pipeline d'indicateurs d'une session
pub struct IndicatorPipeline {
    config: IndicatorConfig,
    current: Option<Rc<IndicatorSet>>,
    key: Option<SeriesKey>,
    stats: PipelineStats,
}

impl IndicatorPipeline {
    pub fn new(config: IndicatorConfig) -> Self {
        Self {
            config,
            current: None,
            key: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn config(&self) -> &IndicatorConfig {
        &self.config
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Dernier IndicatorSet calculé
    pub fn current(&self) -> Option<&Rc<IndicatorSet>> {
        self.current.as_ref()
    }

    /// Oublie l'état (la série associée a été détruite)
    pub fn reset(&mut self) {
        self.current = None;
        self.key = None;
    }

    /// Recalcul complet : fonction pure de la séquence de barres
    pub fn recompute(&self, snapshot: &SeriesSnapshot) -> IndicatorSet {
        let closes = snapshot.closes();
        let cfg = &self.config;
        let mut columns = BTreeMap::new();
        let mut aux = BTreeMap::new();

        columns.insert(cfg.sma_name(), sma(&closes, cfg.sma_period));
        for period in cfg.unique_ema_periods() {
            columns.insert(IndicatorConfig::ema_name(period), ema(&closes, period));
        }

        let (rsi_values, wilder) = rsi_with_state(&closes, cfg.rsi_period);
        columns.insert(cfg.rsi_name(), rsi_values);

        let fast = ema(&closes, cfg.macd_fast);
        let slow = ema(&closes, cfg.macd_slow);
        let macd = difference(&fast, &slow);
        let signal = ema_column(&macd, cfg.macd_signal);
        let histogram = difference(&macd, &signal);
        columns.insert(MACD.to_string(), macd);
        columns.insert(MACD_SIGNAL.to_string(), signal);
        columns.insert(MACD_HISTOGRAM.to_string(), histogram);
        aux.insert(MACD_FAST_EMA.to_string(), fast);
        aux.insert(MACD_SLOW_EMA.to_string(), slow);

        let (upper, middle, lower) = bollinger(&closes, cfg.bollinger_period, cfg.bollinger_k);
        columns.insert(BOLLINGER_UPPER.to_string(), upper);
        columns.insert(BOLLINGER_MIDDLE.to_string(), middle);
        columns.insert(BOLLINGER_LOWER.to_string(), lower);

        IndicatorSet {
            columns,
            aux,
            wilder,
            len: closes.len(),
        }
    }

    /// Mise à jour de la dernière valeur de chaque colonne
    ///
    /// Retourne None si `previous` n'a pas la même longueur que la série
    /// (dans ce cas l'historique a changé : recalcul complet obligatoire)
    pub fn update_tail(
        &self,
        previous: &IndicatorSet,
        snapshot: &SeriesSnapshot,
    ) -> Option<IndicatorSet> {
        let closes = snapshot.closes();
        let index = closes.len().checked_sub(1)?;
        if previous.len != closes.len() {
            return None;
        }

        let cfg = &self.config;
        let mut next = previous.clone();
        let values: Column = closes.iter().copied().map(Some).collect();

        if let Some(column) = next.columns.get_mut(&cfg.sma_name()) {
            set_last(column, trailing(&closes, index, cfg.sma_period).map(mean));
        }

        for period in cfg.unique_ema_periods() {
            let name = IndicatorConfig::ema_name(period);
            let value = ema_tail(&values, previous.get(&name)?, period);
            if let Some(column) = next.columns.get_mut(&name) {
                set_last(column, value);
            }
        }

        // RSI : seed recalculé à l'index n, pas de Wilder ensuite
        let n = cfg.rsi_period;
        let averages = if index < n || n == 0 {
            None
        } else if index == n {
            Some(wilder_seed(&closes, n))
        } else {
            let (avg_gain, avg_loss) = previous.wilder.get(index - 1).copied().flatten()?;
            let (gain, loss) = change_at(&closes, index);
            Some((wilder_step(avg_gain, gain, n), wilder_step(avg_loss, loss, n)))
        };
        if let Some(slot) = next.wilder.last_mut() {
            *slot = averages;
        }
        if let Some(column) = next.columns.get_mut(&cfg.rsi_name()) {
            set_last(column, averages.map(|(g, l)| rsi_from_averages(g, l)));
        }

        // MACD
        let fast = ema_tail(&values, previous.aux.get(MACD_FAST_EMA)?, cfg.macd_fast);
        let slow = ema_tail(&values, previous.aux.get(MACD_SLOW_EMA)?, cfg.macd_slow);
        let macd = match (fast, slow) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        };
        if let Some(column) = next.aux.get_mut(MACD_FAST_EMA) {
            set_last(column, fast);
        }
        if let Some(column) = next.aux.get_mut(MACD_SLOW_EMA) {
            set_last(column, slow);
        }
        if let Some(column) = next.columns.get_mut(MACD) {
            set_last(column, macd);
        }
        let macd_values = next.columns.get(MACD)?.clone();
        let signal = ema_tail(&macd_values, previous.get(MACD_SIGNAL)?, cfg.macd_signal);
        let histogram = match (macd, signal) {
            (Some(m), Some(s)) => Some(m - s),
            _ => None,
        };
        if let Some(column) = next.columns.get_mut(MACD_SIGNAL) {
            set_last(column, signal);
        }
        if let Some(column) = next.columns.get_mut(MACD_HISTOGRAM) {
            set_last(column, histogram);
        }

        // Bollinger
        let stats = trailing(&closes, index, cfg.bollinger_period).map(window_stats);
        let k = cfg.bollinger_k;
        for (name, value) in [
            (BOLLINGER_UPPER, stats.map(|(m, sd)| m + k * sd)),
            (BOLLINGER_MIDDLE, stats.map(|(m, _)| m)),
            (BOLLINGER_LOWER, stats.map(|(m, sd)| m - k * sd)),
        ] {
            if let Some(column) = next.columns.get_mut(name) {
                set_last(column, value);
            }
        }

        Some(next)
    }

    /// Met à jour l'IndicatorSet après une mutation de la série
    ///
    /// - Même série, même nombre de barres scellées et même longueur :
    ///   seule la barre courante a changé => mise à jour de queue
    /// - Sinon : recalcul complet
    pub fn update(&mut self, snapshot: &SeriesSnapshot) -> Rc<IndicatorSet> {
        let key = SeriesKey::of(snapshot);
        let tail = match (&self.current, &self.key) {
            (Some(previous), Some(previous_key)) if *previous_key == key => {
                self.update_tail(previous, snapshot)
            }
            _ => None,
        };

        let set = match tail {
            Some(set) => {
                self.stats.tail_updates += 1;
                trace!(bars = snapshot.len(), "Indicator tail updated");
                set
            }
            None => {
                self.stats.full_recomputes += 1;
                debug!(
                    symbol = %snapshot.symbol,
                    bars = snapshot.len(),
                    revision = snapshot.revision,
                    "Indicators fully recomputed"
                );
                self.recompute(snapshot)
            }
        };

        let set = Rc::new(set);
        self.key = Some(key);
        self.current = Some(Rc::clone(&set));
        set
    }

    /// Compare les valeurs serveur avec les valeurs locales
    ///
    /// Pour chaque colonne serveur, on prend la dernière date présente dans
    /// la série locale où les deux valeurs existent ; un écart relatif
    /// supérieur à `tolerance` est signalé.
    pub fn baseline_divergences(
        &self,
        set: &IndicatorSet,
        snapshot: &SeriesSnapshot,
        baseline: &IndicatorBaseline,
        tolerance: f64,
    ) -> Vec<BaselineDivergence> {
        let resolution = snapshot.resolution;
        let index_of: BTreeMap<i64, usize> = snapshot
            .bars
            .iter()
            .enumerate()
            .map(|(i, b)| (b.open_time, i))
            .collect();

        let mut divergences = Vec::new();
        for (server_name, server_column) in &baseline.columns {
            let Some(local_name) = self.local_name(server_name) else {
                continue;
            };

            let latest = baseline
                .dates
                .iter()
                .zip(server_column)
                .rev()
                .find_map(|(date, value)| {
                    let open_time = resolution.bucket_start(*date);
                    let index = *index_of.get(&open_time)?;
                    Some((open_time, (*value)?, set.value_at(&local_name, index)?))
                });

            if let Some((open_time, server, local)) = latest {
                let scale = server.abs().max(local.abs()).max(f64::EPSILON);
                if (server - local).abs() / scale > tolerance {
                    divergences.push(BaselineDivergence {
                        name: local_name,
                        open_time,
                        server,
                        local,
                    });
                }
            }
        }
        divergences
    }

    /// Nom local correspondant à un nom serveur
    fn local_name(&self, server_name: &str) -> Option<String> {
        match server_name {
            "sma" => Some(self.config.sma_name()),
            "ema" => self
                .config
                .ema_periods
                .first()
                .map(|p| IndicatorConfig::ema_name(*p)),
            "rsi" => Some(self.config.rsi_name()),
            MACD | MACD_SIGNAL | BOLLINGER_UPPER | BOLLINGER_LOWER => Some(server_name.to_string()),
            _ => None,
        }
    }
}

impl Default for IndicatorPipeline {
    fn default() -> Self {
        Self::new(IndicatorConfig::default())
    }
}

// ============================================================================
// Tests unitaires
// ============================================================================
