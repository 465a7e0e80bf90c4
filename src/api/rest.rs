// ============================================================================
// HistoryLoader : historique OHLC + valeurs d'indicateurs via l'API REST
// ============================================================================
// Endpoints du collaborateur REST :
// - GET {base}/analytics/series/{symbol}?resolution=1d&period=730d
//   → {"series":[{"date":...,"open":..,"high":..,"low":..,"close":..,"volume":..}]}
// - GET {base}/analytics/technical/{symbol}
//   → {"indicators":{"date":[...],"sma":[...],"rsi":[...],...}} (null = trou)
//
// CONCEPTS RUST :
// 1. async_trait : trait async (HistorySource) pour brancher une autre source
// 2. anyhow::Context à l'intérieur, ChartError typée à la frontière
// 3. tokio::select! : course entre le fetch et son annulation
// ============================================================================

use std::collections::BTreeMap;
use std::sync::{mpsc, Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::indicators::{Column, IndicatorBaseline};
use crate::engine::session::{EngineEvent, HistorySeed, LoadTicket};
use crate::error::ChartError;
use crate::models::{Bar, Resolution};

// ============================================================================
// Contexte de session (URL + jeton d'authentification)
// ============================================================================

/// Contexte d'authentification partagé entre le loader et le flux
///
/// CONCEPT RUST : Arc<RwLock<...>>
/// - Le jeton peut être renouvelé pendant que des requêtes sont en vol
/// - La prochaine requête lit toujours le jeton le plus récent
#[derive(Debug, Clone)]
pub struct SessionContext {
    base_url: String,
    token: Arc<RwLock<Option<String>>>,
}

impl SessionContext {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: Arc::new(RwLock::new(token)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Jeton courant
    pub fn token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Remplace le jeton (renouvellement de session)
    pub fn rotate(&self, token: Option<String>) {
        match self.token.write() {
            Ok(mut guard) => *guard = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
        debug!("Session token rotated");
    }
}

// ============================================================================
// Trait HistorySource
// ============================================================================

/// Source d'historique
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Charge l'historique d'un symbole
    ///
    /// # Retourne
    /// * `Ok(HistorySeed)` - au moins une barre, triées par open_time
    /// * `Err(HistoryUnavailable)` - erreur du collaborateur ou zéro barre
    async fn load(&self, symbol: &str, resolution: Resolution) -> Result<HistorySeed, ChartError>;
}

// ============================================================================
// Structures JSON
// ============================================================================

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    #[serde(default)]
    series: Vec<SeriesRow>,
}

/// Une ligne de la série ; les prix absents font sauter la ligne
#[derive(Debug, Deserialize)]
struct SeriesRow {
    #[serde(alias = "timestamp", alias = "time")]
    date: Value,
    #[serde(alias = "o")]
    open: Option<f64>,
    #[serde(alias = "h")]
    high: Option<f64>,
    #[serde(alias = "l")]
    low: Option<f64>,
    #[serde(alias = "c")]
    close: Option<f64>,
    #[serde(alias = "v")]
    volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TechnicalResponse {
    indicators: serde_json::Map<String, Value>,
}

/// Noms des colonnes serveur retenues
const BASELINE_COLUMNS: [&str; 7] = [
    "sma",
    "ema",
    "rsi",
    "macd",
    "macd_signal",
    "bollinger_upper",
    "bollinger_lower",
];

// ============================================================================
// Parsing (fonctions pures, testées sans réseau)
// ============================================================================

/// Parse une date du collaborateur en timestamp Unix (secondes, UTC)
///
/// Formats acceptés :
/// - nombre : secondes (ou millisecondes au-delà de 10^11)
/// - "2024-01-15T14:30:00Z" (RFC 3339)
/// - "2024-01-15 14:30:00" / "2024-01-15T14:30:00" (UTC implicite)
/// - "2024-01-15"
pub fn parse_date(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            if raw.abs() >= 100_000_000_000 {
                Some(raw.div_euclid(1000))
            } else {
                Some(raw)
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp());
            }
            for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
                    return Some(dt.and_utc().timestamp());
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp())
        }
        _ => None,
    }
}

/// Convertit les lignes en barres triées par open_time
///
/// # Retourne
/// (barres, nombre de lignes ignorées)
fn parse_series(response: SeriesResponse) -> (Vec<Bar>, usize) {
    let total = response.series.len();
    let mut bars: Vec<Bar> = response
        .series
        .into_iter()
        .filter_map(|row| {
            Some(Bar::new(
                parse_date(&row.date)?,
                row.open?,
                row.high?,
                row.low?,
                row.close?,
                row.volume.unwrap_or(0.0),
            ))
        })
        .collect();
    let skipped = total - bars.len();

    // Le collaborateur ne garantit pas l'ordre
    bars.sort_by_key(|b| b.open_time);
    (bars, skipped)
}

/// Convertit la réponse "technical" en IndicatorBaseline
fn parse_baseline(response: TechnicalResponse) -> Result<IndicatorBaseline> {
    let indicators = response.indicators;
    let dates = indicators
        .get("date")
        .and_then(Value::as_array)
        .context("missing indicator dates")?
        .iter()
        .map(|v| parse_date(v).context("invalid indicator date"))
        .collect::<Result<Vec<i64>>>()?;

    let mut columns = BTreeMap::new();
    for name in BASELINE_COLUMNS {
        let Some(values) = indicators.get(name).and_then(Value::as_array) else {
            continue;
        };
        if values.len() != dates.len() {
            warn!(indicator = name, "Baseline column not aligned with dates, ignored");
            continue;
        }
        let column: Column = values.iter().map(Value::as_f64).collect();
        columns.insert(name.to_string(), column);
    }

    Ok(IndicatorBaseline { dates, columns })
}

fn build_series_url(base: &str, symbol: &str, resolution: Resolution) -> String {
    format!(
        "{}/analytics/series/{}?resolution={}&period={}d",
        base,
        symbol,
        resolution.label(),
        resolution.lookback_days()
    )
}

fn build_technical_url(base: &str, symbol: &str) -> String {
    format!("{}/analytics/technical/{}", base, symbol)
}

// ============================================================================
// RestHistoryLoader
// ============================================================================

/// Loader HTTP (reqwest)
pub struct RestHistoryLoader {
    client: reqwest::Client,
    context: SessionContext,
}

impl RestHistoryLoader {
    pub fn new(context: SessionContext) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tickchart/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, context })
    }

    /// GET authentifié, statut vérifié
    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);
        if let Some(token) = self.context.token() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("HTTP request failed: {}", url))?;

        let status = response.status();
        debug!(status = %status, "Received HTTP response");
        if !status.is_success() {
            anyhow::bail!("collaborator returned HTTP {}", status);
        }
        Ok(response)
    }

    async fn fetch_series(&self, symbol: &str, resolution: Resolution) -> Result<Vec<Bar>> {
        let url = build_series_url(self.context.base_url(), symbol, resolution);
        let response: SeriesResponse = self
            .get(&url)
            .await?
            .json()
            .await
            .context("Failed to parse series JSON")?;

        let (bars, skipped) = parse_series(response);
        if skipped > 0 {
            warn!(skipped, parsed = bars.len(), "Skipped series rows with missing data");
        }
        Ok(bars)
    }

    async fn fetch_baseline(&self, symbol: &str) -> Result<IndicatorBaseline> {
        let url = build_technical_url(self.context.base_url(), symbol);
        let response: TechnicalResponse = self
            .get(&url)
            .await?
            .json()
            .await
            .context("Failed to parse technical JSON")?;
        parse_baseline(response)
    }
}

#[async_trait]
impl HistorySource for RestHistoryLoader {
    #[instrument(skip(self, resolution), fields(resolution = %resolution))]
    async fn load(&self, symbol: &str, resolution: Resolution) -> Result<HistorySeed, ChartError> {
        let unavailable = |reason: String| ChartError::HistoryUnavailable {
            symbol: symbol.to_string(),
            resolution,
            reason,
        };

        let bars = self.fetch_series(symbol, resolution).await.map_err(|e| {
            error!(error = ?e, "Failed to fetch series");
            unavailable(format!("{:#}", e))
        })?;

        if bars.is_empty() {
            return Err(unavailable("no bars returned".to_string()));
        }

        // Les valeurs serveur sont optionnelles
        let baseline = match self.fetch_baseline(symbol).await {
            Ok(baseline) => Some(baseline),
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(error = %reason, "Indicator baseline unavailable");
                None
            }
        };

        info!(bars = bars.len(), baseline = baseline.is_some(), "History loaded");
        Ok(HistorySeed { bars, baseline })
    }
}

/// Lance le chargement en tâche de fond
///
/// - Course entre le fetch et l'annulation du ticket
/// - Une fois annulé, rien n'est envoyé (même si la réponse est arrivée)
/// - Doit être appelé dans le contexte d'un runtime tokio
pub fn spawn_load(
    source: Arc<dyn HistorySource>,
    ticket: LoadTicket,
    events: mpsc::Sender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let LoadTicket {
            token,
            binding,
            cancel,
        } = ticket;

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(binding = %binding, "History fetch cancelled");
                return;
            }
            result = source.load(&binding.symbol, binding.resolution) => result,
        };

        if cancel.is_cancelled() {
            debug!(binding = %binding, "History response dropped after cancellation");
            return;
        }
        if events.send(EngineEvent::History { token, result }).is_err() {
            debug!("Event loop gone, history response dropped");
        }
    })
}

// ============================================================================
// Tests unitaires
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::session::{Binding, RequestToken};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date(&json!(1_700_000_000)), Some(1_700_000_000));
        assert_eq!(parse_date(&json!(1_700_000_000_000_i64)), Some(1_700_000_000));
        assert_eq!(parse_date(&json!("2024-01-15")), Some(1_705_276_800));
        assert_eq!(parse_date(&json!("2024-01-15 00:00:00")), Some(1_705_276_800));
        assert_eq!(parse_date(&json!("2024-01-15T01:00:00+01:00")), Some(1_705_276_800));
        assert_eq!(parse_date(&json!("not a date")), None);
        assert_eq!(parse_date(&json!(null)), None);
    }

    #[test]
    fn test_parse_series_sorts_and_skips_gaps() {
        let response: SeriesResponse = serde_json::from_value(json!({
            "series": [
                {"date": "2024-01-17", "open": 3.0, "high": 3.0, "low": 3.0, "close": 3.0, "volume": 10},
                {"date": "2024-01-15", "open": 1.0, "high": 1.0, "low": 1.0, "close": 1.0},
                {"date": "2024-01-16", "open": null, "high": 2.0, "low": 2.0, "close": 2.0}
            ]
        }))
        .unwrap();

        let (bars, skipped) = parse_series(response);
        assert_eq!(skipped, 1);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, 1.0);
        assert_eq!(bars[0].volume, 0.0);
        assert_eq!(bars[1].volume, 10.0);
    }

    #[test]
    fn test_parse_baseline() {
        let response: TechnicalResponse = serde_json::from_value(json!({
            "indicators": {
                "date": ["2024-01-15", "2024-01-16"],
                "sma": [null, 101.5],
                "rsi": [55.0, 60.0],
                "unknown": [1, 2]
            }
        }))
        .unwrap();

        let baseline = parse_baseline(response).unwrap();
        assert_eq!(baseline.dates, vec![1_705_276_800, 1_705_363_200]);
        assert_eq!(baseline.columns["sma"], vec![None, Some(101.5)]);
        assert!(!baseline.columns.contains_key("unknown"));
    }

    #[test]
    fn test_build_urls() {
        let url = build_series_url("http://localhost:8000/api", "AAPL", Resolution::H1);
        assert_eq!(
            url,
            "http://localhost:8000/api/analytics/series/AAPL?resolution=1h&period=60d"
        );
        assert_eq!(
            build_technical_url("http://x", "TSLA"),
            "http://x/analytics/technical/TSLA"
        );
    }

    #[test]
    fn test_session_context_rotation() {
        let context = SessionContext::new("http://localhost/api/", Some("a".to_string()));
        assert_eq!(context.base_url(), "http://localhost/api");

        let shared = context.clone();
        shared.rotate(Some("b".to_string()));
        assert_eq!(context.token(), Some("b".to_string()));
    }

    /// Source factice : répond après un délai
    struct SlowSource {
        delay: Duration,
    }

    #[async_trait]
    impl HistorySource for SlowSource {
        async fn load(&self, _symbol: &str, _resolution: Resolution) -> Result<HistorySeed, ChartError> {
            tokio::time::sleep(self.delay).await;
            Ok(HistorySeed {
                bars: vec![Bar::from_price(0, 1.0, 0.0)],
                baseline: None,
            })
        }
    }

    fn ticket(token: u64) -> LoadTicket {
        LoadTicket {
            token: RequestToken(token),
            binding: Binding::new("AAPL", Resolution::D1),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_spawn_load_reports_with_token() {
        let (tx, rx) = mpsc::channel();
        let source = Arc::new(SlowSource {
            delay: Duration::from_millis(1),
        });

        spawn_load(source, ticket(7), tx).await.unwrap();

        match rx.try_recv() {
            Ok(EngineEvent::History { token, result }) => {
                assert_eq!(token, RequestToken(7));
                assert_eq!(result.unwrap().bars.len(), 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_fetch_never_reports() {
        let (tx, rx) = mpsc::channel();
        let source = Arc::new(SlowSource {
            delay: Duration::from_secs(30),
        });
        let ticket = ticket(1);
        let cancel = ticket.cancel.clone();

        let handle = spawn_load(source, ticket, tx);
        cancel.cancel();
        handle.await.unwrap();

        assert!(rx.try_recv().is_err());
    }
}
