// ============================================================================
// Structure : Bar (Open, High, Low, Close, Volume)
// ============================================================================
// Représente une chandelle japonaise pour un bucket de temps fixe
//
// CONCEPTS RUST :
// 1. i64 : timestamp Unix en secondes (début du bucket)
// 2. f64 : prix et volume (volume fractionnaire pour les cryptos)
// 3. Copy : une barre est petite, on la copie au lieu de la partager
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ChartError;

/// Résolution (largeur du bucket) des chandelles
///
/// CONCEPT : Résolution vs fenêtre visible
/// - Resolution : granularité des chandelles (5m, 1h, 1d, etc.)
/// - ViewRange : période affichée à l'écran
/// - La résolution détermine la profondeur d'historique demandée
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// 5 minutes
    #[serde(rename = "5m")]
    M5,
    /// 15 minutes
    #[serde(rename = "15m")]
    M15,
    /// 30 minutes
    #[serde(rename = "30m")]
    M30,
    /// 1 heure
    #[serde(rename = "1h")]
    H1,
    /// 4 heures
    #[serde(rename = "4h")]
    H4,
    /// 1 jour (daily)
    #[serde(rename = "1d")]
    D1,
    /// 1 semaine (weekly)
    #[serde(rename = "1w")]
    W1,
}

impl Resolution {
    /// Largeur du bucket en secondes
    pub fn seconds(&self) -> i64 {
        match self {
            Resolution::M5 => 5 * 60,
            Resolution::M15 => 15 * 60,
            Resolution::M30 => 30 * 60,
            Resolution::H1 => 60 * 60,
            Resolution::H4 => 4 * 60 * 60,
            Resolution::D1 => 24 * 60 * 60,
            Resolution::W1 => 7 * 24 * 60 * 60,
        }
    }

    /// Label court, utilisé pour l'affichage et pour l'API REST
    ///
    /// CONCEPT RUST : &'static str
    /// - String littérale stockée dans le binaire, aucune allocation
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::M5 => "5m",
            Resolution::M15 => "15m",
            Resolution::M30 => "30m",
            Resolution::H1 => "1h",
            Resolution::H4 => "4h",
            Resolution::D1 => "1d",
            Resolution::W1 => "1w",
        }
    }

    /// Parse un label ("5m", "1h", "1d", ...)
    pub fn from_label(label: &str) -> Option<Resolution> {
        Resolution::all()
            .into_iter()
            .find(|r| r.label().eq_ignore_ascii_case(label.trim()))
    }

    /// Profondeur d'historique demandée au collaborateur REST (en jours)
    ///
    /// Objectif : 300-500 chandelles par chargement
    /// - Intraday : limité à 60 jours côté fournisseur
    /// - 1d : 2 ans, 1w : 5 ans
    pub fn lookback_days(&self) -> u32 {
        match self {
            Resolution::M5 => 7,
            Resolution::M15 => 14,
            Resolution::M30 => 30,
            Resolution::H1 => 60,
            Resolution::H4 => 60,
            Resolution::D1 => 730,
            Resolution::W1 => 1825,
        }
    }

    /// Début du bucket contenant `timestamp`
    ///
    /// bucket = floor(timestamp / resolution) * resolution
    /// - div_euclid : arrondi vers -∞ même pour les timestamps négatifs
    /// - Saturé aux extrémités de i64 (jamais de panique sur overflow)
    pub fn bucket_start(&self, timestamp: i64) -> i64 {
        let width = self.seconds();
        timestamp.div_euclid(width).saturating_mul(width)
    }

    /// Vrai si la résolution est intraday (plusieurs chandelles par jour)
    pub fn is_intraday(&self) -> bool {
        !matches!(self, Resolution::D1 | Resolution::W1)
    }

    /// Retourne toutes les résolutions disponibles
    pub fn all() -> Vec<Resolution> {
        vec![
            Resolution::M5,
            Resolution::M15,
            Resolution::M30,
            Resolution::H1,
            Resolution::H4,
            Resolution::D1,
            Resolution::W1,
        ]
    }

    /// Résolution suivante (cycle)
    pub fn next(&self) -> Resolution {
        match self {
            Resolution::M5 => Resolution::M15,
            Resolution::M15 => Resolution::M30,
            Resolution::M30 => Resolution::H1,
            Resolution::H1 => Resolution::H4,
            Resolution::H4 => Resolution::D1,
            Resolution::D1 => Resolution::W1,
            Resolution::W1 => Resolution::M5, // Boucle
        }
    }

    /// Résolution précédente (cycle)
    pub fn previous(&self) -> Resolution {
        match self {
            Resolution::M5 => Resolution::W1, // Boucle
            Resolution::M15 => Resolution::M5,
            Resolution::M30 => Resolution::M15,
            Resolution::H1 => Resolution::M30,
            Resolution::H4 => Resolution::H1,
            Resolution::D1 => Resolution::H4,
            Resolution::W1 => Resolution::D1,
        }
    }
}

impl Default for Resolution {
    /// Résolution par défaut : journalière
    fn default() -> Self {
        Resolution::D1
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Une chandelle japonaise (candlestick)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Début du bucket (timestamp Unix, secondes)
    pub open_time: i64,

    /// Prix d'ouverture (Open)
    pub open: f64,

    /// Prix le plus haut (High)
    pub high: f64,

    /// Prix le plus bas (Low)
    pub low: f64,

    /// Prix de clôture (Close)
    pub close: f64,

    /// Volume échangé
    pub volume: f64,
}

impl Bar {
    /// Constructeur : crée une nouvelle chandelle
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Ouvre une chandelle à partir d'un seul prix : open = high = low = close
    pub fn from_price(open_time: i64, price: f64, volume: f64) -> Self {
        Self::new(open_time, price, price, price, price, volume)
    }

    /// Intègre un prix dans la chandelle en cours
    ///
    /// CONCEPT RUST : &mut self
    /// - Modifie la chandelle sur place (pas de copie)
    pub fn absorb(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }

    /// Vérifie l'invariant : low ≤ min(open, close) ≤ max(open, close) ≤ high
    pub fn validate(&self) -> Result<(), ChartError> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) || !self.volume.is_finite() {
            return Err(ChartError::InvalidBar {
                open_time: self.open_time,
                reason: "non-finite value".to_string(),
            });
        }

        if self.low > self.open.min(self.close) || self.open.max(self.close) > self.high {
            return Err(ChartError::InvalidBar {
                open_time: self.open_time,
                reason: format!(
                    "OHLC out of order (o={} h={} l={} c={})",
                    self.open, self.high, self.low, self.close
                ),
            });
        }

        Ok(())
    }

    /// Vérifie si la chandelle est haussière (bullish)
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// Variation en pourcentage depuis l'ouverture
    pub fn change_percent(&self) -> f64 {
        if self.open == 0.0 {
            0.0
        } else {
            ((self.close - self.open) / self.open) * 100.0
        }
    }
}

// ============================================================================
// Tests unitaires
// ============================================================================
