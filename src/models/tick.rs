// ============================================================================
// Structure : Tick
// ============================================================================
// Mise à jour de prix temps réel pour un symbole
// Éphémère : consommée immédiatement par le store, jamais stockée
//
// FORMAT DU FLUX :
// - Objet unique : {"symbol":"AAPL","price":187.2,"timestamp":1700000000}
// - Forme courte : {"s":"AAPL","p":187.2,"t":1700000000000,"v":12}
//   (t en millisecondes)
// - Enveloppe : {"type":"trade","data":[ ...ticks... ]}
// - Autres messages (alert_triggered, ping, ...) : messages de contrôle ignorés
// ============================================================================

use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;

/// Un tick de prix
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// Symbole du ticker (ex: "AAPL")
    pub symbol: String,

    /// Dernier prix échangé
    pub price: f64,

    /// Timestamp Unix en secondes
    pub timestamp: i64,

    /// Volume optionnel (None = 0 dans le store)
    pub volume: Option<f64>,
}

impl Tick {
    /// Constructeur
    pub fn new(symbol: impl Into<String>, price: f64, timestamp: i64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            timestamp,
            volume: None,
        }
    }

    /// Ajoute un volume au tick (builder)
    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }
}

/// Résultat du parsing d'un message du flux
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Un ou plusieurs ticks ; `rejected` liste les éléments invalides d'une enveloppe
    Ticks { ticks: Vec<Tick>, rejected: Vec<String> },

    /// Message de contrôle (type != "trade") : ignoré
    Control(String),
}

/// Représentation JSON d'un tick
///
/// CONCEPT RUST : #[serde(alias = "...")]
/// - Accepte plusieurs noms de champ pour la même donnée
/// - "symbol" ou "s", "price" ou "p", "volume" ou "v"
#[derive(Debug, Deserialize)]
struct RawTick {
    #[serde(alias = "s")]
    symbol: String,
    #[serde(alias = "p")]
    price: f64,
    /// Secondes
    timestamp: Option<i64>,
    /// Millisecondes (forme courte)
    t: Option<i64>,
    #[serde(alias = "v")]
    volume: Option<f64>,
}

impl RawTick {
    fn into_tick(self) -> Result<Tick, String> {
        let timestamp = match (self.timestamp, self.t) {
            (Some(seconds), _) => seconds,
            (None, Some(millis)) => millis.div_euclid(1000),
            (None, None) => return Err("missing timestamp".to_string()),
        };

        // Hors de la plage représentable par chrono : ni date ni bucket valides
        if DateTime::from_timestamp(timestamp, 0).is_none() {
            return Err(format!("timestamp out of range {}", timestamp));
        }

        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(format!("invalid price {}", self.price));
        }

        if self.symbol.trim().is_empty() {
            return Err("empty symbol".to_string());
        }

        Ok(Tick {
            symbol: self.symbol,
            price: self.price,
            timestamp,
            volume: self.volume.filter(|v| v.is_finite() && *v >= 0.0),
        })
    }
}

/// Parse un message texte du flux
///
/// # Retourne
/// * `Ok(WireMessage)` - ticks ou message de contrôle
/// * `Err(String)` - message malformé (à compter puis ignorer)
pub fn parse_message(text: &str) -> Result<WireMessage, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;

    // Message avec un champ "type" : seul "trade" transporte des ticks
    if let Some(kind) = value.get("type").and_then(Value::as_str) {
        if kind != "trade" {
            return Ok(WireMessage::Control(kind.to_string()));
        }
    }

    // Enveloppe {"data": [...]} : chaque élément est validé séparément
    if let Some(data) = value.get("data") {
        let items = data.as_array().ok_or("trade data is not an array")?;
        let mut ticks = Vec::with_capacity(items.len());
        let mut rejected = Vec::new();
        for item in items {
            match parse_item(item) {
                Ok(tick) => ticks.push(tick),
                Err(reason) => rejected.push(reason),
            }
        }
        return Ok(WireMessage::Ticks { ticks, rejected });
    }

    Ok(WireMessage::Ticks {
        ticks: vec![parse_item(&value)?],
        rejected: Vec::new(),
    })
}

fn parse_item(value: &Value) -> Result<Tick, String> {
    RawTick::deserialize(value)
        .map_err(|e| e.to_string())?
        .into_tick()
}

// ============================================================================
// Tests unitaires
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_long_form() {
        let msg = parse_message(r#"{"symbol":"AAPL","price":187.5,"timestamp":1700000000}"#);
        assert_eq!(
            msg,
            Ok(WireMessage::Ticks {
                ticks: vec![Tick::new("AAPL", 187.5, 1_700_000_000)],
                rejected: Vec::new(),
            })
        );
    }

    #[test]
    fn test_parse_short_form_millis() {
        let msg = parse_message(r#"{"s":"TSLA","p":250.0,"t":1700000000999,"v":3}"#).unwrap();
        match msg {
            WireMessage::Ticks { ticks, .. } => {
                assert_eq!(ticks.len(), 1);
                assert_eq!(ticks[0].timestamp, 1_700_000_000);
                assert_eq!(ticks[0].volume, Some(3.0));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_envelope() {
        let text = r#"{"type":"trade","data":[{"s":"AAPL","p":1.0,"t":1000},{"s":"MSFT","p":2.0,"t":2000}]}"#;
        match parse_message(text).unwrap() {
            WireMessage::Ticks { ticks, rejected } => {
                assert!(rejected.is_empty());
                assert_eq!(ticks.len(), 2);
                assert_eq!(ticks[1].symbol, "MSFT");
                assert_eq!(ticks[1].timestamp, 2);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_parse_envelope_keeps_valid_items() {
        let text = r#"{"type":"trade","data":[{"s":"AAPL","p":1.0,"t":1000},{"s":"AAPL","p":-1.0,"t":2000},{"s":"AAPL"},{"s":"AAPL","p":3.0,"t":3000}]}"#;
        match parse_message(text).unwrap() {
            WireMessage::Ticks { ticks, rejected } => {
                assert_eq!(ticks.len(), 2);
                assert_eq!(ticks[1].price, 3.0);
                assert_eq!(rejected.len(), 2);
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert!(parse_message(r#"{"type":"trade","data":{"s":"AAPL"}}"#).is_err());
    }

    #[test]
    fn test_parse_control_message() {
        let text = r#"{"type":"alert_triggered","id":4,"symbol":"AAPL","message":"x"}"#;
        assert_eq!(
            parse_message(text),
            Ok(WireMessage::Control("alert_triggered".to_string()))
        );
    }

    #[test]
    fn test_parse_malformed() {
        assert!(parse_message("not json").is_err());
        assert!(parse_message(r#"{"symbol":"AAPL","price":1.0}"#).is_err()); // pas de timestamp
        assert!(parse_message(r#"{"symbol":"AAPL","price":-1.0,"timestamp":1}"#).is_err());
        assert!(parse_message(r#"{"price":1.0,"timestamp":1}"#).is_err());
    }

    #[test]
    fn test_parse_rejects_out_of_range_timestamp() {
        let min = r#"{"symbol":"AAPL","price":1.0,"timestamp":-9223372036854775808}"#;
        let max = r#"{"symbol":"AAPL","price":1.0,"timestamp":9223372036854775807}"#;
        assert!(parse_message(min).is_err());
        assert!(parse_message(max).is_err());
        // En millisecondes, i64::MAX reste hors de la plage des dates
        assert!(parse_message(r#"{"s":"AAPL","p":1.0,"t":9223372036854775807}"#).is_err());
    }
}
