// ============================================================================
// Candles - Chandeliers japonais en caractères Unicode
// ============================================================================
// Rendu texte ligne par ligne du panneau prix
//
// ALGORITHME :
// - Chaque barre occupe une colonne, placée selon son heure d'ouverture
// - Rendu vertical de haut en bas : pour chaque ligne, un caractère
// - Logique des 3 zones : mèche supérieure, corps, mèche inférieure
// - Seuils fractionnaires (0.25, 0.75) pour précision sub-caractère
// - Les moyennes mobiles et les bandes sont posées ensuite, en points,
//   uniquement sur les cases restées vides
//
// CARACTÈRES UNICODE :
// ┃ Corps plein          │ Mèche pleine
// ╻ Demi-corps (bas)     ╹ Demi-corps (haut)
// ╽ Transition top       ╿ Transition bottom
// ╷ Demi-mèche sup       ╵ Demi-mèche inf
// ============================================================================

use std::ops::Range;

use ratatui::{
    style::{Color, Style},
    text::{Line, Span},
};

use crate::models::Bar;

// ============================================================================
// Constantes
// ============================================================================

pub const UNICODE_VOID: char = ' ';
pub const UNICODE_BODY: char = '┃';
pub const UNICODE_HALF_BODY_BOTTOM: char = '╻';
pub const UNICODE_HALF_BODY_TOP: char = '╹';
pub const UNICODE_WICK: char = '│';
pub const UNICODE_TOP: char = '╽';
pub const UNICODE_BOTTOM: char = '╿';
pub const UNICODE_UPPER_WICK: char = '╷';
pub const UNICODE_LOWER_WICK: char = '╵';

/// Point d'une moyenne mobile ou d'une bande
pub const OVERLAY_GLYPH: char = '·';

const BULLISH_COLOR: Color = Color::Rgb(52, 208, 88);
const BEARISH_COLOR: Color = Color::Rgb(234, 74, 90);

/// Largeur de l'axe Y (prix), réduite sur les panneaux étroits
pub const Y_AXIS_WIDTH: u16 = 12;
pub const NARROW_Y_AXIS_WIDTH: u16 = 8;
pub const ADAPTIVE_Y_AXIS_THRESHOLD: u16 = 80;

/// Un label de prix toutes les N lignes
const Y_LABEL_EVERY: u16 = 4;

/// Largeur de l'axe Y pour une zone de `width` colonnes
pub fn y_axis_width(width: u16) -> u16 {
    if width < ADAPTIVE_Y_AXIS_THRESHOLD {
        NARROW_Y_AXIS_WIDTH
    } else {
        Y_AXIS_WIDTH
    }
}

// ============================================================================
// Échelle verticale
// ============================================================================

/// Conversion prix → hauteur (0 = bas de la zone, `height` = haut)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceScale {
    min: f64,
    max: f64,
    height: u16,
}

impl PriceScale {
    pub fn new(bounds: [f64; 2], height: u16) -> Self {
        Self {
            min: bounds[0],
            max: bounds[1],
            height,
        }
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Hauteur fractionnaire d'un prix
    pub fn height_of(&self, price: f64) -> f64 {
        if self.max == self.min {
            return self.height as f64 / 2.0;
        }
        (price - self.min) / (self.max - self.min) * self.height as f64
    }

    /// Ligne (1..=height) la plus proche d'un prix
    pub fn row_of(&self, price: f64) -> u16 {
        let row = self.height_of(price).round();
        row.clamp(1.0, self.height.max(1) as f64) as u16
    }

    /// Prix affiché en face de la ligne `y`
    pub fn price_at(&self, y: u16) -> f64 {
        if self.height == 0 {
            return self.min;
        }
        self.min + y as f64 * (self.max - self.min) / self.height as f64
    }
}

// ============================================================================
// Un chandelier
// ============================================================================

/// Couleur d'un chandelier (haussier si close >= open)
pub fn candle_color(bar: &Bar) -> Color {
    if bar.close >= bar.open {
        BULLISH_COLOR
    } else {
        BEARISH_COLOR
    }
}

/// Caractère du chandelier `bar` à la ligne `y`
///
/// Cœur de l'algorithme : la position de la ligne par rapport aux hauteurs
/// du plus haut, du corps et du plus bas décide du caractère.
pub fn candle_glyph(bar: &Bar, scale: &PriceScale, y: u16) -> char {
    let row = y as f64;

    let high_y = scale.height_of(bar.high);
    let low_y = scale.height_of(bar.low);
    let max_y = scale.height_of(bar.open.max(bar.close));
    let min_y = scale.height_of(bar.open.min(bar.close));

    // Zone 1 : mèche supérieure (high → haut du corps)
    if high_y.ceil() >= row && row >= max_y.floor() {
        if max_y - row > 0.75 {
            UNICODE_BODY
        } else if max_y - row > 0.25 {
            if high_y - row > 0.75 {
                UNICODE_TOP
            } else {
                UNICODE_HALF_BODY_BOTTOM
            }
        } else if high_y - row > 0.75 {
            UNICODE_WICK
        } else if high_y - row > 0.25 {
            UNICODE_UPPER_WICK
        } else {
            UNICODE_VOID
        }
    }
    // Zone 2 : corps
    else if max_y.floor() >= row && row >= min_y.ceil() {
        UNICODE_BODY
    }
    // Zone 3 : mèche inférieure (bas du corps → low)
    else if min_y.ceil() >= row && row >= low_y.floor() {
        if min_y - row < 0.25 {
            UNICODE_BODY
        } else if min_y - row < 0.75 {
            if low_y - row < 0.25 {
                UNICODE_BOTTOM
            } else {
                UNICODE_HALF_BODY_TOP
            }
        } else if low_y - row < 0.25 {
            UNICODE_WICK
        } else if low_y - row < 0.75 {
            UNICODE_LOWER_WICK
        } else {
            UNICODE_VOID
        }
    } else {
        UNICODE_VOID
    }
}

// ============================================================================
// Placement horizontal
// ============================================================================

/// Colonne de chaque barre de la fenêtre : `(index de la barre, colonne)`
///
/// CONCEPT : Accumulator pattern
/// - La colonne est calculée depuis l'heure d'ouverture, jamais depuis la
///   colonne précédente : pas de dérive d'arrondi
/// - Mêmes bornes que les autres panneaux, donc mêmes abscisses
/// - Plus de barres que de colonnes : la plus récente l'emporte au dessin
pub fn candle_columns(
    bars: &[Bar],
    window: Range<usize>,
    x_bounds: [f64; 2],
    width: usize,
) -> Vec<(usize, usize)> {
    if width == 0 {
        return Vec::new();
    }
    let [from, to] = x_bounds;
    let span = (to - from).max(f64::EPSILON);
    let last_column = (width - 1) as f64;

    window
        .filter_map(|i| {
            let bar = bars.get(i)?;
            let exact = (bar.open_time as f64 - from) / span * last_column;
            let column = exact.round().clamp(0.0, last_column) as usize;
            Some((i, column))
        })
        .collect()
}

// ============================================================================
// Grille de caractères
// ============================================================================

/// Grille `width` x `height` de caractères colorés
///
/// Les lignes sont numérotées comme l'échelle : 1 en bas, `height` en haut
#[derive(Debug, Clone)]
pub struct CandleGrid {
    width: usize,
    height: u16,
    cells: Vec<(char, Color)>,
}

impl CandleGrid {
    pub fn new(width: usize, height: u16) -> Self {
        Self {
            width,
            height,
            cells: vec![(UNICODE_VOID, Color::Reset); width * height as usize],
        }
    }

    fn index(&self, column: usize, y: u16) -> Option<usize> {
        if column >= self.width || y == 0 || y > self.height {
            return None;
        }
        Some((self.height - y) as usize * self.width + column)
    }

    pub fn get(&self, column: usize, y: u16) -> Option<(char, Color)> {
        self.index(column, y).and_then(|i| self.cells.get(i).copied())
    }

    fn set(&mut self, column: usize, y: u16, glyph: char, color: Color) {
        if let Some(cell) = self.index(column, y).and_then(|i| self.cells.get_mut(i)) {
            *cell = (glyph, color);
        }
    }

    /// Dessine les chandeliers placés par `candle_columns`
    pub fn draw_candles(&mut self, bars: &[Bar], placed: &[(usize, usize)], scale: &PriceScale) {
        for &(i, column) in placed {
            let Some(bar) = bars.get(i) else {
                continue;
            };
            let color = candle_color(bar);
            for y in 1..=self.height {
                let glyph = candle_glyph(bar, scale, y);
                if glyph != UNICODE_VOID {
                    self.set(column, y, glyph, color);
                }
            }
        }
    }

    /// Pose une colonne d'indicateur ; les chandeliers restent au premier plan
    pub fn draw_overlay(
        &mut self,
        values: &[Option<f64>],
        placed: &[(usize, usize)],
        scale: &PriceScale,
        color: Color,
    ) {
        for &(i, column) in placed {
            let Some(value) = values.get(i).copied().flatten().filter(|v| v.is_finite()) else {
                continue;
            };
            let y = scale.row_of(value);
            if self.get(column, y).map(|(glyph, _)| glyph) == Some(UNICODE_VOID) {
                self.set(column, y, OVERLAY_GLYPH, color);
            }
        }
    }

    /// Lignes prêtes pour un Paragraph, axe Y à gauche
    ///
    /// Les cases adjacentes de même couleur sont regroupées dans un Span
    pub fn lines(&self, scale: &PriceScale, y_axis_width: u16) -> Vec<Line<'static>> {
        let label_width = (y_axis_width as usize).saturating_sub(3);
        let mut lines = Vec::with_capacity(self.height as usize);

        for y in (1..=self.height).rev() {
            let axis = if y % Y_LABEL_EVERY == 0 {
                format!("{:>w$.2} │ ", scale.price_at(y), w = label_width)
            } else {
                format!("{:>w$} │ ", "", w = label_width)
            };
            let mut spans = vec![Span::styled(axis, Style::default().fg(Color::Gray))];

            let mut run = String::new();
            let mut run_color = Color::Reset;
            for column in 0..self.width {
                let (glyph, color) = self.get(column, y).unwrap_or((UNICODE_VOID, Color::Reset));
                if color != run_color && !run.is_empty() {
                    spans.push(Span::styled(std::mem::take(&mut run), Style::default().fg(run_color)));
                }
                run_color = color;
                run.push(glyph);
            }
            if !run.is_empty() {
                spans.push(Span::styled(run, Style::default().fg(run_color)));
            }

            lines.push(Line::from(spans));
        }
        lines
    }
}

// ============================================================================
// Tests unitaires
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn scale() -> PriceScale {
        // 1 ligne = 1 unité de prix
        PriceScale::new([0.0, 10.0], 10)
    }

    fn column_glyphs(bar: &Bar) -> Vec<char> {
        let scale = scale();
        (1..=10).map(|y| candle_glyph(bar, &scale, y)).collect()
    }

    #[test]
    fn test_price_scale() {
        let scale = scale();
        assert_eq!(scale.height_of(5.0), 5.0);
        assert_eq!(scale.row_of(5.4), 5);
        assert_eq!(scale.row_of(-3.0), 1);
        assert_eq!(scale.row_of(99.0), 10);
        assert_eq!(scale.price_at(4), 4.0);

        // Prix constant : milieu de la zone
        assert_eq!(PriceScale::new([2.0, 2.0], 10).height_of(2.0), 5.0);
    }

    #[test]
    fn test_candle_zones() {
        // Mèche 2..8, corps 4..6
        let bar = Bar::new(0, 4.0, 8.0, 2.0, 6.0, 1.0);
        let glyphs = column_glyphs(&bar);

        assert_eq!(glyphs[9], UNICODE_VOID); // y = 10, au-dessus du plus haut
        assert_eq!(glyphs[7], UNICODE_VOID); // y = 8, le plus haut pile sur la ligne
        assert_eq!(glyphs[6], UNICODE_WICK); // y = 7
        assert_eq!(glyphs[4], UNICODE_BODY); // y = 5
        assert_eq!(glyphs[3], UNICODE_BODY); // y = 4
        assert_eq!(glyphs[2], UNICODE_WICK); // y = 3
        assert_eq!(glyphs[0], UNICODE_VOID); // y = 1, sous le plus bas
        assert_eq!(glyphs.iter().filter(|g| **g == UNICODE_BODY).count(), 2);
    }

    #[test]
    fn test_candle_color() {
        assert_eq!(candle_color(&Bar::new(0, 4.0, 8.0, 2.0, 6.0, 1.0)), BULLISH_COLOR);
        assert_eq!(candle_color(&Bar::new(0, 6.0, 8.0, 2.0, 4.0, 1.0)), BEARISH_COLOR);
        // Doji : haussier
        assert_eq!(candle_color(&Bar::new(0, 5.0, 8.0, 2.0, 5.0, 1.0)), BULLISH_COLOR);
    }

    #[test]
    fn test_candle_columns_follow_time() {
        let bars: Vec<Bar> = (0..5).map(|i| Bar::from_price(i * 60, 1.0, 0.0)).collect();

        // Fenêtre 0..240 sur 5 colonnes : une barre par colonne
        let placed = candle_columns(&bars, 0..5, [0.0, 240.0], 5);
        assert_eq!(placed, vec![(0, 0), (1, 1), (2, 2), (3, 3), (4, 4)]);

        // Fenêtre deux fois plus large : les barres occupent la moitié gauche
        let placed = candle_columns(&bars, 1..3, [0.0, 480.0], 9);
        assert_eq!(placed, vec![(1, 1), (2, 2)]);

        assert!(candle_columns(&bars, 0..5, [0.0, 240.0], 0).is_empty());
    }

    #[test]
    fn test_overlay_stays_behind_candles() {
        let bars = vec![Bar::new(0, 4.0, 8.0, 2.0, 6.0, 1.0), Bar::new(60, 4.0, 5.0, 3.0, 4.5, 1.0)];
        let scale = scale();
        let placed = candle_columns(&bars, 0..2, [0.0, 60.0], 2);

        let mut grid = CandleGrid::new(2, 10);
        grid.draw_candles(&bars, &placed, &scale);
        // 5.0 tombe dans le corps de la première barre, 9.0 au-dessus de la seconde
        grid.draw_overlay(&[Some(5.0), Some(9.0)], &placed, &scale, Color::Yellow);

        assert_eq!(grid.get(0, 5).map(|c| c.0), Some(UNICODE_BODY));
        assert_eq!(grid.get(1, 9), Some((OVERLAY_GLYPH, Color::Yellow)));
        // Valeur absente (lookback) : rien n'est posé
        grid.draw_overlay(&[None, None], &placed, &scale, Color::Blue);
        assert_eq!(grid.get(1, 9), Some((OVERLAY_GLYPH, Color::Yellow)));
    }

    #[test]
    fn test_grid_lines_have_axis() {
        let bars = vec![Bar::new(0, 4.0, 8.0, 2.0, 6.0, 1.0)];
        let scale = scale();
        let mut grid = CandleGrid::new(3, 10);
        grid.draw_candles(&bars, &candle_columns(&bars, 0..1, [0.0, 120.0], 3), &scale);

        let lines = grid.lines(&scale, NARROW_Y_AXIS_WIDTH);
        assert_eq!(lines.len(), 10);
        // y = 10 : pas de label (un label toutes les 4 lignes)
        assert!(lines[0].spans[0].content.trim_start().starts_with('│'));
        // y = 8 : label
        assert!(lines[2].spans[0].content.contains("8.00"));
        let width: usize = lines[5].spans.iter().map(|s| s.content.chars().count()).sum();
        assert_eq!(width, NARROW_Y_AXIS_WIDTH as usize + 3);
    }

    #[test]
    fn test_y_axis_width() {
        assert_eq!(y_axis_width(60), NARROW_Y_AXIS_WIDTH);
        assert_eq!(y_axis_width(120), Y_AXIS_WIDTH);
    }
}
