// ============================================================================
// Configuration de l'application
// ============================================================================
// Ordre de chargement (le dernier gagne) :
// 1. Valeurs par défaut
// 2. Fichier TOML (~/.config/tickchart/config.toml ou --config <chemin>)
// 3. Variables d'environnement TICKCHART_*
//
// CONCEPTS RUST :
// 1. #[serde(default)] : chaque champ absent du TOML prend sa valeur par défaut
// 2. anyhow::Context : messages d'erreur lisibles pour l'utilisateur
// 3. Closure de lookup : les tests injectent un environnement sans toucher au process
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::StreamConfig;
use crate::engine::{IndicatorConfig, SessionOptions};
use crate::error::ChartError;
use crate::models::Resolution;

/// Nom du répertoire applicatif (config + logs)
pub const APP_DIR: &str = "tickchart";

/// Préfixe des variables d'environnement
pub const ENV_PREFIX: &str = "TICKCHART_";

/// Réglages de l'application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Base du collaborateur REST (historique + indicateurs)
    pub api_url: String,
    /// URL du flux de ticks WebSocket
    pub stream_url: String,
    /// Jeton d'authentification (optionnel)
    pub token: Option<String>,
    /// Symbole affiché au démarrage
    pub symbol: String,
    pub resolution: Resolution,
    /// Premier délai de reconnexion du flux
    pub reconnect_base_ms: u64,
    /// Plafond du délai de reconnexion
    pub reconnect_max_ms: u64,
    pub visible_bars: usize,
    pub tick_buffer: usize,
    pub baseline_tolerance: f64,
    pub indicators: IndicatorConfig,
    /// Répertoire des logs (par défaut : données locales de l'utilisateur)
    pub log_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let session = SessionOptions::default();
        Self {
            api_url: "http://localhost:8000/api".to_string(),
            stream_url: StreamConfig::default().url,
            token: None,
            symbol: "AAPL".to_string(),
            resolution: Resolution::default(),
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            visible_bars: session.visible_bars,
            tick_buffer: session.tick_buffer,
            baseline_tolerance: session.baseline_tolerance,
            indicators: session.indicators,
            log_dir: None,
        }
    }
}

impl Settings {
    /// Emplacement par défaut du fichier de configuration
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
    }

    /// Charge les réglages complets
    ///
    /// # Arguments
    /// * `explicit` - chemin passé avec `--config` ; doit exister
    ///
    /// Sans chemin explicite, le fichier par défaut est lu s'il existe
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut settings = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No configuration file, using defaults");
                    Self::default()
                }
            },
        };

        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate().context("Invalid configuration")?;
        Ok(settings)
    }

    /// Lit un fichier TOML
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings = Self::from_toml(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "Configuration loaded");
        Ok(settings)
    }

    /// Parse un document TOML (champs absents = valeurs par défaut)
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Malformed TOML")
    }

    /// Applique les surcharges d'environnement
    ///
    /// CONCEPT RUST : Injection de dépendance par closure
    /// - En production : `|k| std::env::var(k).ok()`
    /// - En test : une HashMap, sans modifier l'environnement du process
    pub fn apply_env<L>(&mut self, lookup: L) -> Result<()>
    where
        L: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(url) = var("API_URL") {
            self.api_url = url;
        }
        if let Some(url) = var("STREAM_URL") {
            self.stream_url = url;
        }
        if let Some(token) = var("TOKEN") {
            self.token = Some(token);
        }
        if let Some(symbol) = var("SYMBOL") {
            self.symbol = symbol;
        }
        if let Some(label) = var("RESOLUTION") {
            self.resolution = Resolution::from_label(&label)
                .with_context(|| format!("{}RESOLUTION: unknown resolution '{}'", ENV_PREFIX, label))?;
        }
        Ok(())
    }

    /// Vérifie la cohérence des réglages
    pub fn validate(&self) -> Result<(), ChartError> {
        if self.api_url.trim().is_empty() {
            return Err(ChartError::Config("api_url must not be empty".to_string()));
        }
        if self.stream_url.trim().is_empty() {
            return Err(ChartError::Config("stream_url must not be empty".to_string()));
        }
        if self.symbol.trim().is_empty() {
            return Err(ChartError::Config("symbol must not be empty".to_string()));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(ChartError::Config(
                "reconnect_base_ms must be in 1..=reconnect_max_ms".to_string(),
            ));
        }
        if self.visible_bars < 2 {
            return Err(ChartError::Config("visible_bars must be at least 2".to_string()));
        }
        if self.tick_buffer == 0 {
            return Err(ChartError::Config("tick_buffer must be greater than 0".to_string()));
        }
        if !self.baseline_tolerance.is_finite() || self.baseline_tolerance < 0.0 {
            return Err(ChartError::Config(
                "baseline_tolerance must be a positive number".to_string(),
            ));
        }
        self.indicators.validate().map_err(ChartError::Config)
    }

    // ========================================================================
    // Conversions vers les réglages des composants
    // ========================================================================

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            url: self.stream_url.clone(),
            reconnect_base: Duration::from_millis(self.reconnect_base_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            visible_bars: self.visible_bars,
            tick_buffer: self.tick_buffer,
            baseline_tolerance: self.baseline_tolerance,
            indicators: self.indicators.clone(),
            ..SessionOptions::default()
        }
    }

    /// Répertoire des logs effectif
    ///
    /// - Linux : ~/.local/share/tickchart/logs
    /// - Repli : ./logs
    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|dir| dir.join(APP_DIR).join("logs"))
                .unwrap_or_else(|| PathBuf::from("./logs"))
        })
    }
}
