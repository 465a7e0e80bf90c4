// ============================================================================
// Module : engine
// ============================================================================
// Le moteur de graphiques, indépendant du terminal et du réseau :
// store de séries, indicateurs, synchronisation de vue, panneaux, session
// ============================================================================

pub mod indicators; // IndicatorPipeline (SMA, EMA, RSI, MACD, Bollinger)
pub mod pane;       // PaneLifecycleManager + traits de rendu
pub mod session;    // ChartSession : point d'entrée de la boucle
pub mod store;      // SeriesStore : source de vérité
pub mod view_sync;  // ViewSyncCoordinator

pub use indicators::{IndicatorConfig, IndicatorPipeline, IndicatorSet};
pub use pane::{PaneFactory, PaneFrame, PaneKind, PaneLifecycleManager, PaneState, PaneSurface};
pub use session::{
    Binding, ChartSession, EngineEvent, HistorySeed, LoadState, LoadTicket, RequestToken,
    SessionOptions,
};
pub use store::{SeriesSnapshot, SeriesStore};
pub use view_sync::{PaneId, ViewSyncCoordinator};
