// ============================================================================
// Chart - Panneaux du graphique dans le terminal
// ============================================================================
// Implémentation terminal des traits PaneSurface / PaneFactory :
// - TerminalPane garde la dernière frame et la fenêtre visible
// - Le dessin se fait plus tard, pendant terminal.draw()
//
// CONCEPTS RUST :
// 1. PaneFrame contient des Rc : cloner une frame ne copie pas les barres
// 2. Iterator chaining : transformer barres et colonnes en points (x, y)
// 3. Séparation état / rendu : render() stocke, draw() dessine
//
// CONCEPTS RATATUI :
// 1. Paragraph : chandeliers en caractères Unicode (voir candles.rs)
// 2. Chart + Dataset : oscillateurs, un Dataset par segment continu
// 3. Sparkline : histogramme compact pour le volume
// ============================================================================

use std::ops::Range;

use chrono::DateTime;
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph, Sparkline},
    Frame,
};
use tracing::debug;

use crate::engine::indicators::{
    BOLLINGER_LOWER, BOLLINGER_MIDDLE, BOLLINGER_UPPER, MACD, MACD_HISTOGRAM, MACD_SIGNAL,
};
use crate::engine::{Binding, IndicatorSet, PaneFactory, PaneFrame, PaneKind, PaneSurface};
use crate::error::ChartError;
use crate::models::{Bar, ViewRange};
use crate::ui::candles::{candle_columns, y_axis_width, CandleGrid, PriceScale};

/// Couleurs des moyennes mobiles, dans l'ordre des colonnes
const OVERLAY_COLORS: [Color; 4] = [Color::Yellow, Color::Magenta, Color::Blue, Color::LightCyan];

/// Une série de points prête à dessiner
struct Series {
    name: String,
    color: Color,
    graph: GraphType,
    segments: Vec<Vec<(f64, f64)>>,
}

// ============================================================================
// Fonctions pures (testées)
// ============================================================================

/// Indices des barres dont l'ouverture est dans la fenêtre
///
/// Sans fenêtre, toutes les barres sont visibles
pub fn visible_window(bars: &[Bar], range: Option<ViewRange>) -> Range<usize> {
    match range {
        None => 0..bars.len(),
        Some(range) => {
            let start = bars.partition_point(|b| b.open_time < range.from);
            let end = bars.partition_point(|b| b.open_time <= range.to);
            start..end.max(start)
        }
    }
}

/// Découpe une colonne en segments continus
///
/// CONCEPT : Gaps
/// - Une valeur absente (lookback insuffisant) coupe la ligne
/// - Chaque segment devient un Dataset distinct
pub fn segments(bars: &[Bar], column: &[Option<f64>], window: Range<usize>) -> Vec<Vec<(f64, f64)>> {
    let mut out: Vec<Vec<(f64, f64)>> = Vec::new();
    let mut current = Vec::new();

    for i in window {
        match (bars.get(i), column.get(i).copied().flatten()) {
            (Some(bar), Some(value)) if value.is_finite() => {
                current.push((bar.open_time as f64, value));
            }
            _ => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Bornes verticales avec 5% de marge
pub fn value_bounds<'a, I>(values: I) -> Option<[f64; 2]>
where
    I: IntoIterator<Item = &'a f64>,
{
    let (min, max) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((f64::MAX, f64::MIN), |(min, max), &v| (min.min(v), max.max(v)));
    if min > max {
        return None;
    }
    let margin = ((max - min) * 0.05).max(max.abs() * 0.001).max(f64::EPSILON);
    Some([min - margin, max + margin])
}

/// Label d'un timestamp selon la résolution
fn time_label(timestamp: i64, intraday: bool) -> String {
    match DateTime::from_timestamp(timestamp, 0) {
        Some(dt) if intraday => dt.format("%m-%d %H:%M").to_string(),
        Some(dt) => dt.format("%Y-%m-%d").to_string(),
        None => timestamp.to_string(),
    }
}

/// Ligne d'heures sous les chandeliers : début à gauche, fin à droite
fn time_axis_line(x_bounds: [f64; 2], intraday: bool, offset: usize, width: usize) -> Line<'static> {
    let left = time_label(x_bounds[0] as i64, intraday);
    let right = time_label(x_bounds[1] as i64, intraday);
    let gap = width.saturating_sub(left.chars().count() + right.chars().count());
    Line::from(Span::styled(
        format!("{}{}{}{}", " ".repeat(offset), left, " ".repeat(gap), right),
        Style::default().fg(Color::Gray),
    ))
}

// ============================================================================
// TerminalPane : surface de rendu d'un panneau
// ============================================================================

/// Panneau dessiné dans le terminal
#[derive(Debug)]
pub struct TerminalPane {
    kind: PaneKind,
    container: String,
    binding: Binding,
    frame: Option<PaneFrame>,
    range: Option<ViewRange>,
    size: (u16, u16),
    released: bool,
}

impl TerminalPane {
    pub fn kind(&self) -> PaneKind {
        self.kind
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn range(&self) -> Option<ViewRange> {
        self.range
    }

    pub fn size(&self) -> (u16, u16) {
        self.size
    }

    pub fn has_frame(&self) -> bool {
        self.frame.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Dessine le panneau dans `area`
    pub fn draw(&self, frame: &mut Frame, area: Rect, focused: bool) {
        let border = if focused { Color::Cyan } else { Color::DarkGray };
        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(border))
            .title(format!(" {} · {} ", self.binding, self.container));

        let Some(data) = &self.frame else {
            render_placeholder(frame, area, block, "En attente de données...");
            return;
        };
        let bars = &data.snapshot.bars;
        let window = visible_window(bars, self.range);
        if window.is_empty() {
            render_placeholder(frame, area, block, "Aucune barre dans la fenêtre");
            return;
        }

        match self.kind {
            PaneKind::Price => self.draw_price(frame, area, block, data, window),
            PaneKind::Volume => self.draw_volume(frame, area, block, bars, window),
            PaneKind::Oscillator => {
                let inner = block.inner(area);
                frame.render_widget(block, area);
                let halves = Layout::default()
                    .direction(Direction::Vertical)
                    .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
                    .split(inner);
                self.draw_rsi(frame, halves[0], data, window.clone());
                self.draw_macd(frame, halves[1], data, window);
            }
        }
    }

    /// Bornes horizontales : la fenêtre partagée, ou l'étendue des barres
    fn x_bounds(&self, bars: &[Bar], window: &Range<usize>) -> [f64; 2] {
        match self.range {
            Some(range) => [range.from as f64, range.to as f64],
            None => {
                let first = bars.get(window.start).map_or(0, |b| b.open_time);
                let last = bars.get(window.end.saturating_sub(1)).map_or(1, |b| b.open_time);
                [first as f64, last.max(first + 1) as f64]
            }
        }
    }

    fn x_axis(&self, bars: &[Bar], window: &Range<usize>) -> Axis<'static> {
        let [from, to] = self.x_bounds(bars, window);
        let intraday = self.binding.resolution.is_intraday();
        Axis::default()
            .style(Style::default().fg(Color::Gray))
            .bounds([from, to])
            .labels(vec![
                Span::raw(time_label(from as i64, intraday)),
                Span::raw(time_label(to as i64, intraday)),
            ])
    }

    /// Chandeliers + moyennes mobiles + bandes de Bollinger
    ///
    /// Rendu texte (Paragraph) : axe Y à gauche, une ligne d'heures en bas
    fn draw_price(
        &self,
        frame: &mut Frame,
        area: Rect,
        block: Block<'_>,
        data: &PaneFrame,
        window: Range<usize>,
    ) {
        let bars = &data.snapshot.bars;
        let inner = block.inner(area);
        let axis_width = y_axis_width(inner.width);
        let plot_width = inner.width.saturating_sub(axis_width) as usize;
        let plot_height = inner.height.saturating_sub(1);
        if plot_width == 0 || plot_height == 0 {
            render_placeholder(frame, area, block, "Panneau trop petit");
            return;
        }

        // Couches : moyennes mobiles colorées, bandes en gris
        let mut overlays: Vec<(&str, Color)> = data
            .indicators
            .names()
            .filter(|name| name.starts_with("sma") || name.starts_with("ema"))
            .enumerate()
            .map(|(i, name)| (name, OVERLAY_COLORS[i % OVERLAY_COLORS.len()]))
            .collect();
        for name in [BOLLINGER_UPPER, BOLLINGER_MIDDLE, BOLLINGER_LOWER] {
            overlays.push((name, Color::DarkGray));
        }

        let overlay_values = overlays
            .iter()
            .filter_map(|(name, _)| data.indicators.get(name)?.get(window.clone()))
            .flat_map(|column| column.iter().flatten());
        let extremes: Vec<f64> = bars[window.clone()]
            .iter()
            .flat_map(|b| [b.low, b.high])
            .collect();
        let bounds = value_bounds(extremes.iter().chain(overlay_values)).unwrap_or([0.0, 1.0]);
        let scale = PriceScale::new(bounds, plot_height);

        let x_bounds = self.x_bounds(bars, &window);
        let placed = candle_columns(bars, window.clone(), x_bounds, plot_width);
        let mut grid = CandleGrid::new(plot_width, plot_height);
        grid.draw_candles(bars, &placed, &scale);
        for (name, color) in &overlays {
            if let Some(column) = data.indicators.get(name) {
                grid.draw_overlay(column, &placed, &scale, *color);
            }
        }

        let mut lines = grid.lines(&scale, axis_width);
        lines.push(time_axis_line(
            x_bounds,
            self.binding.resolution.is_intraday(),
            axis_width as usize,
            plot_width,
        ));

        // Titre : dernier prix puis légende des couches
        let last = bars.get(window.end - 1);
        let mut title = vec![Span::raw(match last {
            Some(bar) => format!(" {:.2}  {:+.2}% ", bar.close, bar.change_percent()),
            None => " ".to_string(),
        })];
        for (name, color) in overlays.iter().filter(|(name, _)| data.indicators.get(name).is_some()) {
            if *color != Color::DarkGray {
                title.push(Span::styled(format!("{} ", name), Style::default().fg(*color)));
            }
        }

        let paragraph = Paragraph::new(lines).block(block.title(Line::from(title)));
        frame.render_widget(paragraph, area);
    }

    /// Volume des barres visibles (les plus récentes si la largeur manque)
    fn draw_volume(
        &self,
        frame: &mut Frame,
        area: Rect,
        block: Block<'_>,
        bars: &[Bar],
        window: Range<usize>,
    ) {
        let width = block.inner(area).width as usize;
        let volumes: Vec<u64> = bars[window]
            .iter()
            .map(|b| b.volume.max(0.0).round() as u64)
            .collect();
        let shown = &volumes[volumes.len().saturating_sub(width.max(1))..];
        let max = shown.iter().copied().max().unwrap_or(0);

        let sparkline = Sparkline::default()
            .block(block.title(format!(" max {} ", max)))
            .data(shown)
            .style(Style::default().fg(Color::Blue));
        frame.render_widget(sparkline, area);
    }

    /// RSI avec les niveaux 30 / 70
    fn draw_rsi(&self, frame: &mut Frame, area: Rect, data: &PaneFrame, window: Range<usize>) {
        let bars = &data.snapshot.bars;
        let Some(name) = data.indicators.names().find(|n| n.starts_with("rsi")) else {
            return;
        };
        let [from, to] = self.x_bounds(bars, &window);
        let mut series = vec![indicator_series(&data.indicators, bars, name, Color::Magenta, &window)];
        for level in [30.0, 70.0] {
            series.push(Series {
                name: String::new(),
                color: Color::DarkGray,
                graph: GraphType::Line,
                segments: vec![vec![(from, level), (to, level)]],
            });
        }
        let latest = data
            .indicators
            .latest(name)
            .map_or_else(|| "-".to_string(), |v| format!("{:.1}", v));
        let block = Block::default().title(format!("{} {}", name, latest));
        let chart = build_chart(&series, block, self.x_axis(bars, &window), [0.0, 100.0], 0);
        frame.render_widget(chart, area);
    }

    /// MACD, signal et histogramme
    fn draw_macd(&self, frame: &mut Frame, area: Rect, data: &PaneFrame, window: Range<usize>) {
        let bars = &data.snapshot.bars;
        let mut histogram = indicator_series(&data.indicators, bars, MACD_HISTOGRAM, Color::Gray, &window);
        histogram.graph = GraphType::Scatter;
        let series = vec![
            histogram,
            indicator_series(&data.indicators, bars, MACD, Color::Cyan, &window),
            indicator_series(&data.indicators, bars, MACD_SIGNAL, Color::Yellow, &window),
        ];
        let y_bounds = series_bounds(&series).unwrap_or([-1.0, 1.0]);
        let block = Block::default().title("macd");
        let chart = build_chart(&series, block, self.x_axis(bars, &window), y_bounds, 3);
        frame.render_widget(chart, area);
    }
}

impl PaneSurface for TerminalPane {
    fn render(&mut self, frame: &PaneFrame) {
        self.frame = Some(frame.clone());
    }

    fn set_range(&mut self, range: ViewRange) {
        self.range = Some(range);
    }

    fn resize(&mut self, width: u16, height: u16) {
        self.size = (width, height);
    }

    fn release(&mut self) {
        self.released = true;
        self.frame = None;
        debug!(container = %self.container, binding = %self.binding, "Terminal pane released");
    }
}

// ============================================================================
// TerminalPaneFactory
// ============================================================================

/// Fabrique de panneaux terminal
///
/// Les conteneurs disponibles sont les zones du layout
#[derive(Debug)]
pub struct TerminalPaneFactory {
    containers: Vec<String>,
    acquired: u64,
}

impl TerminalPaneFactory {
    pub fn new() -> Self {
        Self::with_containers(PaneKind::all().iter().map(PaneKind::container))
    }

    pub fn with_containers<I, S>(containers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            containers: containers.into_iter().map(Into::into).collect(),
            acquired: 0,
        }
    }

    /// Nombre total de surfaces créées
    pub fn acquired(&self) -> u64 {
        self.acquired
    }
}

impl Default for TerminalPaneFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl PaneFactory for TerminalPaneFactory {
    type Surface = TerminalPane;

    fn acquire(
        &mut self,
        container: &str,
        binding: &Binding,
        kind: PaneKind,
    ) -> Result<TerminalPane, ChartError> {
        if !self.containers.iter().any(|c| c == container) {
            return Err(ChartError::PaneAcquisition {
                container: container.to_string(),
                reason: "no such area in the terminal layout".to_string(),
            });
        }
        self.acquired += 1;
        Ok(TerminalPane {
            kind,
            container: container.to_string(),
            binding: binding.clone(),
            frame: None,
            range: None,
            size: (0, 0),
            released: false,
        })
    }
}

// ============================================================================
// Helpers de dessin
// ============================================================================

fn indicator_series(
    indicators: &IndicatorSet,
    bars: &[Bar],
    name: &str,
    color: Color,
    window: &Range<usize>,
) -> Series {
    Series {
        name: name.to_string(),
        color,
        graph: GraphType::Line,
        segments: indicators
            .get(name)
            .map(|column| segments(bars, column, window.clone()))
            .unwrap_or_default(),
    }
}

fn series_bounds(series: &[Series]) -> Option<[f64; 2]> {
    value_bounds(
        series
            .iter()
            .flat_map(|s| s.segments.iter().flatten())
            .map(|(_, y)| y),
    )
}

/// Construit le Chart ; seul le premier segment d'une série porte son nom
fn build_chart<'a>(
    series: &'a [Series],
    block: Block<'a>,
    x_axis: Axis<'a>,
    y_bounds: [f64; 2],
    decimals: usize,
) -> Chart<'a> {
    let datasets: Vec<Dataset> = series
        .iter()
        .flat_map(|s| {
            s.segments.iter().enumerate().map(move |(i, points)| {
                let dataset = Dataset::default()
                    .marker(symbols::Marker::Braille)
                    .graph_type(s.graph)
                    .style(Style::default().fg(s.color))
                    .data(points);
                if i == 0 && !s.name.is_empty() {
                    dataset.name(s.name.as_str())
                } else {
                    dataset
                }
            })
        })
        .collect();

    let y_axis = Axis::default()
        .style(Style::default().fg(Color::Gray))
        .bounds(y_bounds)
        .labels(vec![
            Span::raw(format!("{:.*}", decimals, y_bounds[0])),
            Span::raw(format!("{:.*}", decimals, (y_bounds[0] + y_bounds[1]) / 2.0)),
            Span::raw(format!("{:.*}", decimals, y_bounds[1])),
        ]);

    Chart::new(datasets)
        .block(block)
        .x_axis(x_axis)
        .y_axis(y_axis)
        .hidden_legend_constraints((Constraint::Ratio(1, 3), Constraint::Ratio(1, 2)))
}

/// Affiche un message quand il n'y a rien à dessiner
fn render_placeholder(frame: &mut Frame, area: Rect, block: Block<'_>, message: &str) {
    let text = vec![
        Line::from(""),
        Line::from(Span::styled(
            message.to_string(),
            Style::default().fg(Color::Gray).add_modifier(Modifier::ITALIC),
        )),
    ];
    let paragraph = Paragraph::new(text).block(block).alignment(Alignment::Center);
    frame.render_widget(paragraph, area);
}

// ============================================================================
// Tests unitaires
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Resolution;

    fn bars(n: i64) -> Vec<Bar> {
        (0..n)
            .map(|i| Bar::new(i * 60, 10.0, 11.0, 9.0, 10.0 + i as f64, 5.0))
            .collect()
    }

    #[test]
    fn test_visible_window() {
        let bars = bars(10);
        assert_eq!(visible_window(&bars, None), 0..10);

        let range = ViewRange { from: 120, to: 300 };
        assert_eq!(visible_window(&bars, Some(range)), 2..6);

        let past = ViewRange { from: -600, to: -60 };
        assert!(visible_window(&bars, Some(past)).is_empty());
    }

    #[test]
    fn test_segments_split_on_gaps() {
        let bars = bars(6);
        let column = vec![None, Some(1.0), Some(2.0), None, Some(4.0), Some(5.0)];

        let segs = segments(&bars, &column, 0..6);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0], vec![(60.0, 1.0), (120.0, 2.0)]);
        assert_eq!(segs[1], vec![(240.0, 4.0), (300.0, 5.0)]);

        // Fenêtre partielle
        assert_eq!(segments(&bars, &column, 4..5), vec![vec![(240.0, 4.0)]]);
    }

    #[test]
    fn test_value_bounds() {
        let values = [10.0, 20.0, f64::NAN];
        let [low, high] = value_bounds(values.iter()).unwrap();
        assert!(low < 10.0 && high > 20.0);

        let empty: [f64; 0] = [];
        assert!(value_bounds(empty.iter()).is_none());

        // Valeur constante : bornes non dégénérées
        let [low, high] = value_bounds([5.0].iter()).unwrap();
        assert!(low < high);
    }

    #[test]
    fn test_factory_unknown_container() {
        let mut factory = TerminalPaneFactory::with_containers(["price"]);
        let binding = Binding::new("AAPL", Resolution::D1);

        assert!(factory.acquire("price", &binding, PaneKind::Price).is_ok());
        let err = factory.acquire("volume", &binding, PaneKind::Volume).unwrap_err();
        assert!(matches!(err, ChartError::PaneAcquisition { .. }));
        assert_eq!(factory.acquired(), 1);
    }

    #[test]
    fn test_surface_keeps_state() {
        let mut factory = TerminalPaneFactory::new();
        let binding = Binding::new("AAPL", Resolution::M5);
        let mut pane = factory.acquire("oscillator", &binding, PaneKind::Oscillator).unwrap();

        pane.set_range(ViewRange { from: 0, to: 600 });
        pane.resize(80, 12);
        assert_eq!(pane.range(), Some(ViewRange { from: 0, to: 600 }));
        assert_eq!(pane.size(), (80, 12));
        assert!(!pane.has_frame());

        pane.release();
        assert!(pane.is_released());
    }

    #[test]
    fn test_time_axis_line_spans_plot() {
        let line = time_axis_line([0.0, 86_400.0], false, 8, 40);
        let text: String = line.spans.iter().map(|s| s.content.as_ref()).collect();
        assert_eq!(text.chars().count(), 48);
        assert!(text.trim_start().starts_with("1970-01-01"));
        assert!(text.ends_with("1970-01-02"));
    }

    #[test]
    fn test_time_label() {
        assert_eq!(time_label(0, false), "1970-01-01");
        assert_eq!(time_label(3_600, true), "01-01 01:00");
    }
}
