// ============================================================================
// Gestion des événements
// ============================================================================
// Gère les événements clavier, le redimensionnement et les ticks de rafraîchissement
//
// CONCEPTS RUST :
// 1. Enums avec variants : représenter différents types d'événements
// 2. Pattern matching : une fonction is_*_event par action
// 3. Error handling avec Result
// ============================================================================

use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, Event as CrosstermEvent, KeyCode, KeyEvent, KeyEventKind};

/// Événements de l'application
#[derive(Debug, Clone)]
pub enum Event {
    /// Touche pressée
    Key(KeyEvent),

    /// Terminal redimensionné (colonnes, lignes)
    Resize(u16, u16),

    /// Tick régulier : la boucle draine les événements du moteur
    Tick,
}

/// Gestionnaire d'événements
pub struct EventHandler {
    /// Attente maximale d'un événement terminal
    timeout: Duration,
}

impl EventHandler {
    /// Crée un gestionnaire avec un timeout de poll
    ///
    /// Un timeout court garde l'affichage réactif aux ticks du flux
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Lit le prochain événement (bloquant avec timeout)
    ///
    /// - Si pas d'événement avant le timeout, retourne Ok(Event::Tick)
    /// - Les Release sont ignorés (certains OS envoient Press ET Release)
    pub fn next(&self) -> Result<Event> {
        if event::poll(self.timeout)? {
            match event::read()? {
                CrosstermEvent::Key(key) if key.kind == KeyEventKind::Press => Ok(Event::Key(key)),
                CrosstermEvent::Resize(width, height) => Ok(Event::Resize(width, height)),
                // Autres événements (release, souris, focus) ignorés
                _ => Ok(Event::Tick),
            }
        } else {
            Ok(Event::Tick)
        }
    }
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

// ============================================================================
// Helpers : Convertir Event en action
// ============================================================================

fn key_code(event: &Event) -> Option<KeyCode> {
    match event {
        Event::Key(key) => Some(key.code),
        _ => None,
    }
}

/// 'q' : quitter (en deux temps)
pub fn is_quit_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Char('q') | KeyCode::Char('Q')))
}

/// Échap
pub fn is_escape_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Esc))
}

/// Entrée
pub fn is_enter_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Enter))
}

/// Backspace
pub fn is_backspace_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Backspace))
}

/// Flèche gauche : pan vers le passé
pub fn is_pan_left_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Left))
}

/// Flèche droite : pan vers le présent
pub fn is_pan_right_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Right))
}

/// '+' (ou '=' sans shift) : zoom avant
pub fn is_zoom_in_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Char('+') | KeyCode::Char('=')))
}

/// '-' : zoom arrière
pub fn is_zoom_out_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Char('-') | KeyCode::Char('_')))
}

/// Tab : panneau suivant
pub fn is_focus_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Tab))
}

/// 'l' : résolution suivante
pub fn is_next_resolution_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Char('l')))
}

/// 'h' : résolution précédente
pub fn is_previous_resolution_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Char('h')))
}

/// 'a' : saisir un nouveau symbole
pub fn is_symbol_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Char('a') | KeyCode::Char('A')))
}

/// 'r' : recharger le binding courant
pub fn is_reload_event(event: &Event) -> bool {
    matches!(key_code(event), Some(KeyCode::Char('r') | KeyCode::Char('R')))
}

/// Caractère valide dans un symbole (lettres, chiffres, '-', '.', '^', '=')
pub fn is_symbol_char_event(event: &Event) -> bool {
    matches!(
        key_code(event),
        Some(KeyCode::Char(c)) if c.is_alphanumeric() || matches!(c, '-' | '.' | '^' | '=')
    )
}

/// Extrait le caractère d'un événement clavier si c'est un caractère
pub fn get_char_from_event(event: &Event) -> Option<char> {
    match key_code(event) {
        Some(KeyCode::Char(c)) => Some(c),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================
