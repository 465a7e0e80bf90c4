// ============================================================================
// Module : api
// ============================================================================
// Clients des collaborateurs externes :
// - rest : historique OHLC + valeurs d'indicateurs (reqwest)
// - stream : flux de ticks temps réel (WebSocket)
// ============================================================================

pub mod rest;   // HistoryLoader REST
pub mod stream; // TickIngestor WebSocket

// Re-export des types principaux
pub use rest::{spawn_load, HistorySource, RestHistoryLoader, SessionContext};
pub use stream::{IngestCounters, IngestStats, StreamConfig, TickIngestor};
