// ============================================================================
// Structure : ViewRange
// ============================================================================
// Fenêtre de temps visible, partagée par tous les panneaux d'une session
// ============================================================================

use serde::{Deserialize, Serialize};

/// Fenêtre visible [from, to] en timestamps Unix (secondes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRange {
    pub from: i64,
    pub to: i64,
}

impl ViewRange {
    /// Crée une fenêtre ; None si from >= to
    pub fn new(from: i64, to: i64) -> Option<Self> {
        if from < to {
            Some(Self { from, to })
        } else {
            None
        }
    }

    /// Durée de la fenêtre en secondes
    pub fn span(&self) -> i64 {
        self.to.saturating_sub(self.from)
    }

    /// Vrai si le timestamp est dans la fenêtre (bornes incluses)
    pub fn contains(&self, timestamp: i64) -> bool {
        self.from <= timestamp && timestamp <= self.to
    }

    /// Décale la fenêtre de `delta` secondes (pan)
    pub fn shifted(&self, delta: i64) -> Self {
        Self {
            from: self.from.saturating_add(delta),
            to: self.to.saturating_add(delta),
        }
    }

    /// Zoom autour du centre
    ///
    /// - factor < 1.0 : zoom avant (fenêtre plus étroite)
    /// - factor > 1.0 : zoom arrière
    /// - La fenêtre ne descend jamais sous `min_span` secondes
    pub fn zoomed(&self, factor: f64, min_span: i64) -> Self {
        let center = self.from.saturating_add(self.span() / 2);
        let span = ((self.span() as f64 * factor).round() as i64).max(min_span.max(1));
        let from = center.saturating_sub(span / 2);
        Self {
            from,
            to: from.saturating_add(span),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_empty_range() {
        assert!(ViewRange::new(10, 10).is_none());
        assert!(ViewRange::new(20, 10).is_none());
        assert_eq!(ViewRange::new(0, 10).map(|r| r.span()), Some(10));
    }

    #[test]
    fn test_shift_and_zoom() {
        let range = ViewRange { from: 0, to: 1000 };
        assert_eq!(range.shifted(100), ViewRange { from: 100, to: 1100 });

        let zoomed = range.zoomed(0.5, 10);
        assert_eq!(zoomed.span(), 500);
        assert!(zoomed.contains(500));

        // Jamais en dessous du span minimal
        assert_eq!(range.zoomed(0.0, 60).span(), 60);
    }
}
