// ============================================================================
// Dashboard - Rendu de l'interface principale
// ============================================================================
// Dessine l'écran : en-tête (état), panneaux empilés, footer (raccourcis)
//
// CONCEPTS RATATUI :
// 1. Frame : surface de dessin
// 2. Layout : découpage de l'espace en zones
// 3. Widgets : Block, Paragraph, Line et Span
// ============================================================================

use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

use crate::api::IngestCounters;
use crate::app::{App, Screen};
use crate::engine::{LoadState, PaneKind};
use crate::ui::chart::TerminalPaneFactory;

/// Dessine l'interface complète
///
/// CONCEPT RUST : Routing avec match sur enum
/// - Le graphique reste visible en mode saisie, seul le footer change
pub fn render(frame: &mut Frame, app: &App<TerminalPaneFactory>) {
    let chunks = create_layout(frame.size());

    render_header(frame, app, chunks[0]);
    render_panes(frame, app, chunks[1]);

    match app.current_screen {
        Screen::Chart => render_footer(frame, app, chunks[2]),
        Screen::InputMode => render_input_footer(frame, app, chunks[2]),
    }
}

// ============================================================================
// Layout : Découpage de l'écran
// ============================================================================

/// Crée le layout principal (header, panneaux, footer)
fn create_layout(area: Rect) -> Vec<Rect> {
    Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header : 3 lignes
            Constraint::Min(0),    // Panneaux : tout le reste
            Constraint::Length(3), // Footer : 3 lignes
        ])
        .split(area)
        .to_vec()
}

/// Hauteur relative de chaque type de panneau
fn pane_weight(kind: PaneKind) -> u32 {
    match kind {
        PaneKind::Price => 6,
        PaneKind::Volume => 2,
        PaneKind::Oscillator => 4,
    }
}

/// Zones des panneaux dans un terminal de taille `size`
///
/// Utilisé par le rendu et par main.rs pour transmettre la taille aux panneaux
pub fn pane_areas(size: Rect, kinds: &[PaneKind]) -> Vec<Rect> {
    let area = create_layout(size)[1];
    let total: u32 = kinds.iter().map(|k| pane_weight(*k)).sum();
    let constraints: Vec<Constraint> = kinds
        .iter()
        .map(|k| Constraint::Ratio(pane_weight(*k), total.max(1)))
        .collect();
    Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(area)
        .to_vec()
}

// ============================================================================
// Header : binding, état de chargement, flux
// ============================================================================

fn render_header(frame: &mut Frame, app: &App<TerminalPaneFactory>, area: Rect) {
    let session = app.session();
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(" tickchart ")
        .title_alignment(Alignment::Center);

    let binding = session
        .binding()
        .map_or_else(|| "aucun symbole".to_string(), |b| b.to_string());

    let (state_text, state_color) = match session.state() {
        LoadState::Idle => ("idle".to_string(), Color::Gray),
        LoadState::Loading => ("chargement...".to_string(), Color::Yellow),
        LoadState::Ready => ("historique chargé".to_string(), Color::Green),
        LoadState::Unavailable(reason) => (format!("historique indisponible : {}", reason), Color::Red),
    };

    let ingest = &app.ingest;
    let (stream_text, stream_color) = if ingest.connected {
        ("● live", Color::Green)
    } else {
        ("○ offline", Color::Red)
    };

    let mut spans = vec![
        Span::styled(binding, Style::default().add_modifier(Modifier::BOLD)),
        Span::raw("  "),
        Span::styled(state_text, Style::default().fg(state_color)),
        Span::raw("  "),
        Span::styled(stream_text, Style::default().fg(stream_color)),
        Span::styled(ingest_summary(ingest), Style::default().fg(Color::Gray)),
    ];

    if let Some(stats) = session.store_stats() {
        spans.push(Span::styled(
            format!("  tardifs {}", stats.late_dropped),
            Style::default().fg(Color::Gray),
        ));
    }

    let paragraph = Paragraph::new(Line::from(spans))
        .block(block)
        .alignment(Alignment::Center);
    frame.render_widget(paragraph, area);
}

/// Compteurs du flux affichés dans l'en-tête
///
/// Les messages de contrôle (alertes, ping) ne sont pas des rejets : ils
/// n'apparaissent pas ici.
fn ingest_summary(ingest: &IngestCounters) -> String {
    format!(
        "  ticks {}  malformés {}  filtrés {}  reconnexions {}",
        ingest.delivered, ingest.malformed, ingest.filtered, ingest.reconnects
    )
}

// ============================================================================
// Panneaux
// ============================================================================

fn render_panes(frame: &mut Frame, app: &App<TerminalPaneFactory>, area: Rect) {
    let panes = app.session().panes();
    let ids = panes.ids();
    let kinds: Vec<PaneKind> = ids.iter().filter_map(|id| panes.kind(*id)).collect();
    let areas = pane_areas(frame.size(), &kinds);
    let focused = app.focused_pane();

    if app.session().binding().is_none() {
        let paragraph = Paragraph::new(vec![
            Line::from(""),
            Line::from(Span::styled(
                "Appuyez sur [a] pour choisir un symbole",
                Style::default().fg(Color::Gray),
            )),
        ])
        .block(Block::default().borders(Borders::ALL))
        .alignment(Alignment::Center);
        frame.render_widget(paragraph, area);
        return;
    }

    // Un panneau non monté laisse sa zone vide
    for (id, _, surface) in panes.surfaces() {
        if let Some(pane_area) = ids.iter().position(|p| *p == id).and_then(|i| areas.get(i)) {
            surface.draw(frame, *pane_area, focused == Some(id));
        }
    }
}

// ============================================================================
// Footer : Instructions
// ============================================================================

/// Dessine le footer avec les raccourcis clavier
fn render_footer(frame: &mut Frame, app: &App<TerminalPaneFactory>, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let key = Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD);

    let shortcuts = if app.is_awaiting_quit_confirmation() {
        Line::from(vec![
            Span::styled(
                "⚠  Appuyez sur ",
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                "[q]",
                Style::default()
                    .fg(Color::Red)
                    .add_modifier(Modifier::BOLD)
                    .add_modifier(Modifier::SLOW_BLINK),
            ),
            Span::styled(
                " à nouveau pour quitter, ou n'importe quelle autre touche pour annuler ⚠",
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            ),
        ])
    } else {
        Line::from(vec![
            Span::styled("[q]", key),
            Span::raw(" Quit  "),
            Span::styled("[←→]", key),
            Span::raw(" Pan  "),
            Span::styled("[+-]", key),
            Span::raw(" Zoom  "),
            Span::styled("[Tab]", key),
            Span::raw(" Pane  "),
            Span::styled("[h l]", key),
            Span::raw(" Resolution  "),
            Span::styled("[a]", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)),
            Span::raw(" Symbol  "),
            Span::styled("[r]", key),
            Span::raw(" Reload"),
        ])
    };

    let paragraph = Paragraph::new(vec![shortcuts])
        .block(block)
        .alignment(Alignment::Center);
    frame.render_widget(paragraph, area);
}

/// Dessine le footer en mode input avec la ligne de saisie
fn render_input_footer(frame: &mut Frame, app: &App<TerminalPaneFactory>, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green))
        .title(" [Enter] Confirm  [ESC] Cancel ");

    let input_line = Line::from(vec![
        Span::styled(
            app.input_prompt.as_str(),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::styled(app.input_buffer.as_str(), Style::default().fg(Color::White)),
        Span::styled(
            "█", // Curseur
            Style::default().fg(Color::White).add_modifier(Modifier::SLOW_BLINK),
        ),
    ]);

    let paragraph = Paragraph::new(vec![input_line])
        .block(block)
        .alignment(Alignment::Left);
    frame.render_widget(paragraph, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_summary_separates_counters() {
        let counters = IngestCounters {
            delivered: 12,
            filtered: 3,
            malformed: 2,
            ignored: 40,
            reconnects: 1,
            ..IngestCounters::default()
        };
        let text = ingest_summary(&counters);
        assert!(text.contains("ticks 12"));
        assert!(text.contains("malformés 2"));
        assert!(text.contains("filtrés 3"));
        assert!(text.contains("reconnexions 1"));
        assert!(!text.contains("40"));
    }

    #[test]
    fn test_pane_areas_follow_weights() {
        let size = Rect::new(0, 0, 100, 66);
        let areas = pane_areas(size, &PaneKind::all());

        assert_eq!(areas.len(), 3);
        // Le panneau prix est le plus haut, le volume le plus petit
        assert!(areas[0].height > areas[2].height);
        assert!(areas[2].height > areas[1].height);
        // Empilés sous l'en-tête
        assert_eq!(areas[0].y, 3);
        assert_eq!(areas[1].y, areas[0].y + areas[0].height);
    }
}
