// ============================================================================
// Structure : App
// ============================================================================
// Gère l'état global de l'application TUI
//
// CONCEPTS RUST :
// 1. State Management : centraliser l'état dans une seule structure
// 2. Générique sur la fabrique de panneaux : le terminal en production,
//    une fabrique d'enregistrement dans les tests
// 3. Les actions qui déclenchent des I/O retournent un LoadTicket :
//    c'est main.rs qui lance les tâches, App reste synchrone
//
// PATTERN : "Application State"
// - Tous les composants de l'UI lisent depuis App
// - Toutes les modifications passent par les méthodes de App
// ============================================================================

use crate::api::IngestCounters;
use crate::engine::{
    Binding, ChartSession, EngineEvent, LoadState, LoadTicket, PaneFactory, PaneId,
};
use crate::models::Resolution;

/// Fraction de la fenêtre parcourue par un pan
const PAN_FRACTION: i64 = 4;

/// Facteur de zoom par pression de +/-
const ZOOM_STEP: f64 = 0.8;

/// Nombre minimal de barres visibles après zoom
const MIN_VISIBLE_BARS: i64 = 5;

/// Écrans de l'application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    /// Vue principale : les panneaux du graphique
    Chart,

    /// Mode saisie : permet de capturer un nouveau symbole
    /// - Enter valide, ESC annule
    InputMode,
}

/// État principal de l'application
pub struct App<F: PaneFactory> {
    /// Indique si l'application doit continuer à tourner
    pub running: bool,

    /// Écran actuellement affiché
    pub current_screen: Screen,

    /// Two-step quit : première pression de 'q' arme, seconde quitte
    pub confirm_quit: bool,

    /// Buffer de saisie pour le mode Input
    pub input_buffer: String,

    /// Prompt affiché en mode Input
    pub input_prompt: String,

    /// Dernier état connu du flux temps réel (affiché dans l'en-tête)
    pub ingest: IngestCounters,

    /// Session de graphique (store, indicateurs, panneaux)
    session: ChartSession<F>,

    /// Index du panneau qui a le focus
    focused: usize,
}

impl<F: PaneFactory> App<F> {
    pub fn new(session: ChartSession<F>) -> Self {
        Self {
            running: true,
            current_screen: Screen::Chart,
            confirm_quit: false,
            input_buffer: String::new(),
            input_prompt: String::new(),
            ingest: IngestCounters::default(),
            session,
            focused: 0,
        }
    }

    pub fn session(&self) -> &ChartSession<F> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ChartSession<F> {
        &mut self.session
    }

    /// Quitte l'application
    pub fn quit(&mut self) {
        self.running = false;
        self.session.close();
    }

    /// Vérifie si l'application doit continuer
    pub fn is_running(&self) -> bool {
        self.running
    }

    // ========================================================================
    // Binding : symbole et résolution
    // ========================================================================

    /// Affiche un nouveau symbole ; la résolution courante est conservée
    pub fn select_symbol(&mut self, symbol: &str) -> Option<LoadTicket> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            return None;
        }
        let resolution = self.resolution().unwrap_or_default();
        Some(self.session.select(Binding::new(symbol, resolution)))
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.session.binding().map(|b| b.resolution)
    }

    /// Passe à la résolution suivante (5m → 15m → ... → 1w → 5m)
    pub fn next_resolution(&mut self) -> Option<LoadTicket> {
        self.change_resolution(Resolution::next)
    }

    /// Passe à la résolution précédente
    pub fn previous_resolution(&mut self) -> Option<LoadTicket> {
        self.change_resolution(Resolution::previous)
    }

    fn change_resolution(&mut self, step: fn(&Resolution) -> Resolution) -> Option<LoadTicket> {
        let binding = self.session.binding()?.clone();
        let next = Binding::new(binding.symbol, step(&binding.resolution));
        Some(self.session.select(next))
    }

    /// Recharge le binding courant depuis zéro
    pub fn reload(&mut self) -> Option<LoadTicket> {
        self.session.reload()
    }

    /// Route un événement des tâches d'I/O vers la session
    ///
    /// # Retourne
    /// * `Some(LoadTicket)` - la session s'est réinitialisée, relancer les I/O
    pub fn handle_engine_event(&mut self, event: EngineEvent) -> Option<LoadTicket> {
        match event {
            EngineEvent::History { token, result } => self.session.on_history(token, result),
            EngineEvent::Tick { token, tick } => {
                self.session.on_tick(token, tick);
                None
            }
        }
    }

    /// Vrai pendant le chargement de l'historique
    pub fn is_loading(&self) -> bool {
        *self.session.state() == LoadState::Loading
    }

    // ========================================================================
    // Panneaux : focus, pan, zoom
    // ========================================================================

    /// Panneau qui a le focus
    pub fn focused_pane(&self) -> Option<PaneId> {
        let ids = self.session.panes().ids();
        ids.get(self.focused.min(ids.len().saturating_sub(1))).copied()
    }

    /// Donne le focus au panneau suivant (cyclique)
    pub fn focus_next(&mut self) {
        let count = self.session.panes().ids().len();
        if count > 0 {
            self.focused = (self.focused + 1) % count;
        }
    }

    /// Décale la fenêtre d'un quart de sa largeur
    ///
    /// `direction` : -1 vers le passé, +1 vers le présent
    pub fn pan(&mut self, direction: i64) -> bool {
        let (Some(range), Some(resolution)) = (self.session.shared_range(), self.resolution()) else {
            return false;
        };
        let step = (range.span() / PAN_FRACTION).max(resolution.seconds());
        self.session.set_range(range.shifted(step * direction.signum()))
    }

    /// Zoom avant (`zoom_in = true`) ou arrière autour du centre
    pub fn zoom(&mut self, zoom_in: bool) -> bool {
        let (Some(range), Some(resolution)) = (self.session.shared_range(), self.resolution()) else {
            return false;
        };
        let factor = if zoom_in { ZOOM_STEP } else { 1.0 / ZOOM_STEP };
        let min_span = resolution.seconds() * MIN_VISIBLE_BARS;
        self.session.set_range(range.zoomed(factor, min_span))
    }

    /// Taille d'un panneau à l'écran (appelé par le rendu)
    pub fn resize_pane(&mut self, pane: PaneId, width: u16, height: u16) {
        self.session.resize(pane, width, height);
    }

    // ========================================================================
    // Quit en deux temps
    // ========================================================================

    pub fn request_quit(&mut self) {
        self.confirm_quit = true;
    }

    pub fn cancel_quit(&mut self) {
        self.confirm_quit = false;
    }

    pub fn is_awaiting_quit_confirmation(&self) -> bool {
        self.confirm_quit
    }

    // ========================================================================
    // Input Mode Management
    // ========================================================================

    /// Entre en mode input avec un prompt donné
    pub fn start_input(&mut self, prompt: String) {
        self.current_screen = Screen::InputMode;
        self.input_buffer.clear();
        self.input_prompt = prompt;
    }

    /// Annule le mode input et retourne au graphique
    pub fn cancel_input(&mut self) {
        self.current_screen = Screen::Chart;
        self.input_buffer.clear();
        self.input_prompt.clear();
    }

    /// Récupère la valeur saisie et retourne au graphique
    pub fn submit_input(&mut self) -> String {
        let value = std::mem::take(&mut self.input_buffer);
        self.current_screen = Screen::Chart;
        self.input_prompt.clear();
        value
    }

    pub fn append_char(&mut self, c: char) {
        self.input_buffer.push(c);
    }

    pub fn backspace(&mut self) {
        self.input_buffer.pop();
    }

    pub fn is_in_input_mode(&self) -> bool {
        self.current_screen == Screen::InputMode
    }
}

// ============================================================================
// Tests unitaires
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::pane::testing::RecordingFactory;
    use crate::engine::{HistorySeed, SessionOptions};
    use crate::models::Bar;

    const DAY: i64 = 86_400;

    fn app() -> App<RecordingFactory> {
        let options = SessionOptions {
            visible_bars: 20,
            ..SessionOptions::default()
        };
        App::new(ChartSession::new(RecordingFactory::default(), options))
    }

    fn loaded_app() -> App<RecordingFactory> {
        let mut app = app();
        let ticket = app.select_symbol("aapl").unwrap();
        let bars = (0..40)
            .map(|i| Bar::new(i * DAY, 100.0, 101.0, 99.0, 100.5, 1_000.0))
            .collect();
        app.handle_engine_event(EngineEvent::History {
            token: ticket.token,
            result: Ok(HistorySeed { bars, baseline: None }),
        });
        app
    }

    #[test]
    fn test_app_creation() {
        let app = app();
        assert!(app.is_running());
        assert_eq!(app.current_screen, Screen::Chart);
        assert!(app.resolution().is_none());
    }

    #[test]
    fn test_select_symbol_keeps_resolution() {
        let mut app = app();
        assert!(app.select_symbol("   ").is_none());

        app.select_symbol("aapl").unwrap();
        let ticket = app.next_resolution().unwrap();
        let resolution = ticket.binding.resolution;

        let ticket = app.select_symbol("tsla").unwrap();
        assert_eq!(ticket.binding.symbol, "TSLA");
        assert_eq!(ticket.binding.resolution, resolution);
    }

    #[test]
    fn test_resolution_cycle_rebinds() {
        let mut app = app();
        assert!(app.next_resolution().is_none());

        let first = app.select_symbol("AAPL").unwrap();
        let next = app.next_resolution().unwrap();
        assert!(first.cancel.is_cancelled());
        assert_eq!(next.binding.resolution, first.binding.resolution.next());

        let back = app.previous_resolution().unwrap();
        assert_eq!(back.binding.resolution, first.binding.resolution);
    }

    #[test]
    fn test_history_event_fits_view() {
        let app = loaded_app();
        assert!(!app.is_loading());
        let range = app.session().shared_range().unwrap();
        assert_eq!(range.from, 20 * DAY);
        assert_eq!(range.to, 40 * DAY);
    }

    #[test]
    fn test_pan_and_zoom_move_shared_range() {
        let mut app = loaded_app();
        let before = app.session().shared_range().unwrap();

        assert!(app.pan(-1));
        let panned = app.session().shared_range().unwrap();
        assert_eq!(panned.span(), before.span());
        assert!(panned.from < before.from);
        // Le panneau qui a le focus suit aussi
        for (_, _, surface) in app.session().panes().surfaces() {
            assert_eq!(surface.range, Some(panned));
        }

        assert!(app.zoom(true));
        let zoomed = app.session().shared_range().unwrap();
        assert!(zoomed.span() < panned.span());

        // Le zoom s'arrête à MIN_VISIBLE_BARS barres
        for _ in 0..50 {
            app.zoom(true);
        }
        let span = app.session().shared_range().unwrap().span();
        assert_eq!(span, MIN_VISIBLE_BARS * DAY);
    }

    #[test]
    fn test_pan_without_data_is_noop() {
        let mut app = app();
        assert!(!app.pan(1));
        app.select_symbol("AAPL");
        assert!(!app.zoom(false));
    }

    #[test]
    fn test_focus_cycles() {
        let mut app = loaded_app();
        let ids = app.session().panes().ids();
        assert_eq!(app.focused_pane(), Some(ids[0]));
        app.focus_next();
        assert_eq!(app.focused_pane(), Some(ids[1]));
        for _ in 0..ids.len() - 1 {
            app.focus_next();
        }
        assert_eq!(app.focused_pane(), Some(ids[0]));
    }

    #[test]
    fn test_input_mode() {
        let mut app = app();
        app.start_input("Symbol: ".to_string());
        assert!(app.is_in_input_mode());

        app.append_char('M');
        app.append_char('S');
        app.append_char('X');
        app.backspace();
        assert_eq!(app.submit_input(), "MS");
        assert!(!app.is_in_input_mode());
        assert!(app.input_buffer.is_empty());
    }

    #[test]
    fn test_two_step_quit() {
        let mut app = app();
        app.request_quit();
        assert!(app.is_awaiting_quit_confirmation());
        app.cancel_quit();
        assert!(!app.is_awaiting_quit_confirmation());

        app.quit();
        assert!(!app.is_running());
    }
}
