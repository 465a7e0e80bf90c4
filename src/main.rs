// ============================================================================
// tickchart - Graphique temps réel dans le terminal
// ============================================================================
// Affiche un symbole : historique REST + ticks WebSocket + indicateurs,
// répartis sur trois panneaux synchronisés (prix, volume, oscillateurs)
//
// CONCEPTS RUST CLÉS :
// 1. Terminal raw mode : contrôle total du terminal
// 2. Event loop : boucle qui draine les événements du moteur, dessine, lit le clavier
// 3. Async dans sync : le runtime tokio exécute les I/O, la boucle reste synchrone
// 4. Channels : les tâches d'I/O envoient des EngineEvent, la boucle les applique
// ============================================================================

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};

use anyhow::{bail, Context, Result};
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use tracing::{debug, error, info, warn};

use tickchart::api::{spawn_load, HistorySource, RestHistoryLoader, SessionContext, TickIngestor};
use tickchart::app::App;
use tickchart::config::Settings;
use tickchart::engine::{Binding, ChartSession, EngineEvent, LoadTicket};
use tickchart::ui::{events::Event, pane_areas, render, EventHandler, TerminalPaneFactory};

type Tui = Terminal<CrosstermBackend<io::Stdout>>;

/// Nombre maximal d'événements moteur appliqués entre deux frames
///
/// Un flux très actif ne doit pas empêcher le dessin ni la lecture du clavier
const MAX_EVENTS_PER_FRAME: usize = 2_048;

// ============================================================================
// Arguments de ligne de commande
// ============================================================================

/// Arguments reconnus : `--config <chemin>` et un symbole optionnel
#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    symbol: Option<String>,
}

fn parse_args<I>(args: I) -> Result<Args>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = Args::default();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config expects a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            flag if flag.starts_with('-') => bail!("unknown option {}", flag),
            symbol => parsed.symbol = Some(symbol.to_string()),
        }
    }
    Ok(parsed)
}

// ============================================================================
// Initialisation du logging
// ============================================================================
// CONCEPT : Logging dans une app TUI
// - Les println! ne fonctionnent pas une fois le TUI lancé
// - On log vers un fichier à rotation quotidienne
// ============================================================================

/// Initialise le système de logging vers fichier
///
/// # Utilisation
/// ```bash
/// tail -f ~/.local/share/tickchart/logs/tickchart.log.*
/// RUST_LOG=tickchart=trace cargo run
/// ```
fn init_logging(log_dir: &Path) -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "tickchart.log");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickchart=debug,info".into()),
        )
        .init();

    info!(log_dir = %log_dir.display(), "Logging initialised");
    Ok(())
}

// ============================================================================
// Io : collaborateurs externes
// ============================================================================
// CONCEPT : Le moteur ne fait jamais d'I/O lui-même
// - select() retourne un LoadTicket
// - Io::launch() lance le fetch d'historique et l'abonnement au flux
// - Le CancellationToken du ticket arrête les deux au prochain select()
// ============================================================================

struct Io {
    history: Arc<dyn HistorySource>,
    ingestor: TickIngestor,
    events: mpsc::Sender<EngineEvent>,
}

impl Io {
    fn launch(&mut self, ticket: LoadTicket) {
        info!(binding = %ticket.binding, token = ticket.token.0, "Launching history fetch and tick subscription");
        self.ingestor.subscribe(&ticket, self.events.clone());
        spawn_load(Arc::clone(&self.history), ticket, self.events.clone());
    }
}

// ============================================================================
// Point d'entrée du programme
// ============================================================================

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(symbol) = args.symbol {
        settings.symbol = symbol;
    }

    init_logging(&settings.log_dir()).unwrap_or_else(|e| {
        eprintln!("⚠️  Warning: Failed to initialize logging: {:#}", e);
        eprintln!("   Continuing without logging...");
    });
    info!(symbol = %settings.symbol, resolution = %settings.resolution, api = %settings.api_url, "tickchart starting up");

    // CONCEPT RUST : Runtime + enter()
    // - Le runtime exécute les tâches sur ses propres threads
    // - enter() permet d'appeler tokio::spawn depuis la boucle synchrone
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let _guard = runtime.enter();

    let (events_tx, events_rx) = mpsc::channel::<EngineEvent>();
    let context = SessionContext::new(settings.api_url.clone(), settings.token.clone());
    let mut io = Io {
        history: Arc::new(RestHistoryLoader::new(context.clone())?),
        ingestor: TickIngestor::new(settings.stream_config(), context),
        events: events_tx,
    };

    let session = ChartSession::new(TerminalPaneFactory::new(), settings.session_options());
    let mut app = App::new(session);
    let ticket = app
        .session_mut()
        .select(Binding::new(settings.symbol.as_str(), settings.resolution));
    io.launch(ticket);

    debug!("Setting up terminal");
    let mut terminal = setup_terminal()?;
    let events = EventHandler::default();

    info!("Starting event loop");
    let result = run(&mut terminal, &mut app, &events, &mut io, &events_rx);

    debug!("Restoring terminal");
    restore_terminal(&mut terminal)?;

    app.quit();
    io.ingestor.unsubscribe();

    match &result {
        Ok(_) => info!("Application exited normally"),
        Err(e) => error!(error = ?e, "Application exited with error"),
    }
    result
}

// ============================================================================
// Event loop
// ============================================================================

fn run(
    terminal: &mut Tui,
    app: &mut App<TerminalPaneFactory>,
    events: &EventHandler,
    io: &mut Io,
    events_rx: &mpsc::Receiver<EngineEvent>,
) -> Result<()> {
    while app.is_running() {
        drain_engine_events(app, io, events_rx);

        app.ingest = io.ingestor.stats().snapshot();
        sync_pane_sizes(terminal, app)?;
        terminal.draw(|frame| render(frame, app))?;

        match events.next() {
            Ok(event) => {
                if let Some(ticket) = handle_event(app, event) {
                    io.launch(ticket);
                }
            }
            Err(e) => warn!(error = %e, "Failed to read terminal event"),
        }
    }
    Ok(())
}

/// Applique les événements des tâches d'I/O, dans l'ordre d'arrivée
fn drain_engine_events(
    app: &mut App<TerminalPaneFactory>,
    io: &mut Io,
    events_rx: &mpsc::Receiver<EngineEvent>,
) {
    for _ in 0..MAX_EVENTS_PER_FRAME {
        match events_rx.try_recv() {
            Ok(event) => {
                // StaleSeed : la session s'est réinitialisée, il faut relancer les I/O
                if let Some(ticket) = app.handle_engine_event(event) {
                    io.launch(ticket);
                }
            }
            Err(mpsc::TryRecvError::Empty) => break,
            Err(mpsc::TryRecvError::Disconnected) => {
                error!("Engine event channel disconnected");
                break;
            }
        }
    }
}

/// Transmet à chaque panneau la taille de sa zone
///
/// Les tailles identiques sont ignorées par le gestionnaire de panneaux
fn sync_pane_sizes(terminal: &Tui, app: &mut App<TerminalPaneFactory>) -> Result<()> {
    let size = terminal.size().context("Failed to read terminal size")?;
    let panes = app.session().panes();
    let ids = panes.ids();
    let kinds: Vec<_> = ids.iter().filter_map(|id| panes.kind(*id)).collect();
    for (id, area) in ids.into_iter().zip(pane_areas(size, &kinds)) {
        app.resize_pane(id, area.width, area.height);
    }
    Ok(())
}

/// Traite un événement clavier
///
/// # Retourne
/// * `Some(LoadTicket)` - le binding a changé, les I/O doivent être lancées
fn handle_event(app: &mut App<TerminalPaneFactory>, event: Event) -> Option<LoadTicket> {
    use tickchart::ui::events::{
        get_char_from_event, is_backspace_event, is_enter_event, is_escape_event,
        is_focus_event, is_next_resolution_event, is_pan_left_event, is_pan_right_event,
        is_previous_resolution_event, is_quit_event, is_reload_event, is_symbol_char_event,
        is_symbol_event, is_zoom_in_event, is_zoom_out_event,
    };

    // Mode saisie : toutes les touches vont au buffer
    if app.is_in_input_mode() {
        match event {
            Event::Key(_) if is_escape_event(&event) => {
                debug!("User cancelled input");
                app.cancel_input();
            }
            Event::Key(_) if is_enter_event(&event) => {
                let symbol = app.submit_input();
                info!(symbol = %symbol.trim(), "User selected symbol");
                return app.select_symbol(&symbol);
            }
            Event::Key(_) if is_backspace_event(&event) => app.backspace(),
            Event::Key(_) if is_symbol_char_event(&event) => {
                if let Some(c) = get_char_from_event(&event) {
                    app.append_char(c);
                }
            }
            _ => {}
        }
        return None;
    }

    match event {
        Event::Key(_) if is_quit_event(&event) => {
            if app.is_awaiting_quit_confirmation() {
                info!("User confirmed quit");
                app.quit();
            } else {
                info!("User requested quit (awaiting confirmation)");
                app.request_quit();
            }
            None
        }
        Event::Key(_) => {
            app.cancel_quit();
            if is_pan_left_event(&event) {
                app.pan(-1);
            } else if is_pan_right_event(&event) {
                app.pan(1);
            } else if is_zoom_in_event(&event) {
                app.zoom(true);
            } else if is_zoom_out_event(&event) {
                app.zoom(false);
            } else if is_focus_event(&event) {
                app.focus_next();
            } else if is_symbol_event(&event) {
                app.start_input("Symbol: ".to_string());
            } else if is_next_resolution_event(&event) {
                return app.next_resolution();
            } else if is_previous_resolution_event(&event) {
                return app.previous_resolution();
            } else if is_reload_event(&event) {
                info!("User requested reload");
                return app.reload();
            }
            None
        }
        Event::Resize(width, height) => {
            debug!(width, height, "Terminal resized");
            None
        }
        Event::Tick => None,
    }
}

// ============================================================================
// Setup et restauration du terminal
// ============================================================================

fn setup_terminal() -> Result<Tui> {
    enable_raw_mode().context("Failed to enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend).context("Failed to create terminal")
}

fn restore_terminal(terminal: &mut Tui) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
    terminal.show_cursor()?;
    Ok(())
}
