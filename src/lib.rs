// ============================================================================
// tickchart - Library
// ============================================================================
// Expose les modules publics pour le binaire et les tests d'intégration
// ============================================================================

pub mod api;    // Collaborateurs externes (REST + WebSocket)
pub mod app;    // État de l'application
pub mod config; // Réglages (TOML + environnement)
pub mod engine; // Moteur de graphiques
pub mod error;  // Taxonomie d'erreurs
pub mod models; // Structures de données
pub mod ui;     // Interface utilisateur
