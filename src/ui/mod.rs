// ============================================================================
// Module : ui
// ============================================================================
// Gère toute l'interface utilisateur (Terminal User Interface)
// ============================================================================

pub mod candles;   // Chandeliers Unicode du panneau prix
pub mod chart;     // Panneaux terminal (PaneSurface / PaneFactory)
pub mod dashboard; // Rendu de l'écran principal
pub mod events;    // Gestion des événements clavier

// Re-exports pour simplifier les imports
pub use chart::{TerminalPane, TerminalPaneFactory};
pub use dashboard::{pane_areas, render};
pub use events::{Event, EventHandler};
