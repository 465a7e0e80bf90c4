// ============================================================================
// Module : models
// ============================================================================
// Ce module contient les structures de données de base du moteur
// (barres, ticks, fenêtre visible)
// ============================================================================

pub mod bar;        // Chandelles et résolutions
pub mod tick;       // Ticks temps réel et format du flux
pub mod view_range; // Fenêtre de temps visible

// Re-export des structures principales pour simplifier les imports
// Au lieu de : use tickchart::models::bar::Bar;
// On peut faire : use tickchart::models::Bar;
pub use bar::{Bar, Resolution};
pub use tick::{parse_message, Tick, WireMessage};
pub use view_range::ViewRange;
