// ============================================================================
// Erreurs du moteur de graphiques
// ============================================================================
// Taxonomie typée des erreurs du moteur (store, ingestion, historique, panneaux)
//
// CONCEPTS RUST :
// 1. thiserror : génère Display + Error à partir des attributs #[error]
// 2. Enum d'erreurs : l'appelant peut matcher sur chaque variant
// 3. anyhow reste utilisé dans la couche application (main.rs, config)
// ============================================================================

use thiserror::Error;

use crate::models::Resolution;

/// Erreurs du moteur de graphiques
///
/// Politique de propagation :
/// - Transport : absorbée et retentée localement par l'ingestion
/// - HistoryUnavailable : remontée comme état explicite (écran vide)
/// - SymbolMismatch / LateTickDropped : rejets défensifs, comptés, jamais affichés
/// - StaleSeed : violation de contrat, force la réinitialisation de la session
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChartError {
    /// Flux temps réel déconnecté ou connexion impossible
    #[error("transport error: {0}")]
    Transport(String),

    /// Historique indisponible (erreur du collaborateur ou zéro barre)
    #[error("history unavailable for {symbol} ({resolution}): {reason}")]
    HistoryUnavailable {
        symbol: String,
        resolution: Resolution,
        reason: String,
    },

    /// Tick d'un autre symbole que celui du store
    #[error("tick for {received} rejected by store bound to {expected}")]
    SymbolMismatch { expected: String, received: String },

    /// Tick arrivé après la fermeture de son bucket
    #[error("late tick dropped: bucket {bucket} is older than current bar {current}")]
    LateTickDropped { bucket: i64, current: i64 },

    /// Historique injecté après l'établissement d'une barre live
    #[error("history seed rejected for {symbol}: live data already applied")]
    StaleSeed { symbol: String },

    /// Barre invalide (prix non finis ou OHLC incohérent)
    #[error("invalid bar at {open_time}: {reason}")]
    InvalidBar { open_time: i64, reason: String },

    /// Impossible d'obtenir une surface de dessin pour un panneau
    #[error("pane acquisition failed for {container}: {reason}")]
    PaneAcquisition { container: String, reason: String },

    /// Configuration invalide
    #[error("configuration error: {0}")]
    Config(String),
}

impl ChartError {
    /// Vrai pour les rejets défensifs qui ne sont jamais montrés à l'utilisateur
    pub fn is_defensive_drop(&self) -> bool {
        matches!(
            self,
            ChartError::SymbolMismatch { .. } | ChartError::LateTickDropped { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defensive_drops() {
        let late = ChartError::LateTickDropped { bucket: 0, current: 60 };
        assert!(late.is_defensive_drop());

        let stale = ChartError::StaleSeed { symbol: "AAPL".to_string() };
        assert!(!stale.is_defensive_drop());
    }

    #[test]
    fn test_history_unavailable_message() {
        let err = ChartError::HistoryUnavailable {
            symbol: "TSLA".to_string(),
            resolution: Resolution::D1,
            reason: "zero bars".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("TSLA"));
        assert!(msg.contains("1d"));
        assert!(msg.contains("zero bars"));
    }
}
