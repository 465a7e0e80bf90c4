// ============================================================================
// TickIngestor : flux de prix temps réel (WebSocket)
// ============================================================================
// - Un seul abonnement actif : le nouvel abonnement attend la fin du précédent
// - Reconnexion avec backoff exponentiel plafonné (1s, 2s, 4s ... 30s),
//   remis à zéro à chaque connexion réussie ; les trous ne sont pas comblés
// - Filtrage par symbole côté client
// - Messages malformés : comptés puis ignorés
// - Chaque tick livré porte le RequestToken du binding abonné
//
// CONCEPTS RUST :
// 1. tokio-tungstenite : client WebSocket async
// 2. CancellationToken : arrêt coopératif de la tâche
// 3. Atomics : compteurs lus par l'UI sans verrou
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::api::rest::SessionContext;
use crate::engine::session::{EngineEvent, LoadTicket, RequestToken};
use crate::error::ChartError;
use crate::models::{parse_message, WireMessage};

/// Réglages du flux
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub url: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8000/ws/prices".to_string(),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

/// Compteurs d'ingestion partagés avec l'UI
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    delivered: AtomicU64,
    filtered: AtomicU64,
    malformed: AtomicU64,
    ignored: AtomicU64,
    reconnects: AtomicU64,
    connected: AtomicBool,
}

/// Copie instantanée des compteurs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestCounters {
    pub received: u64,
    pub delivered: u64,
    pub filtered: u64,
    pub malformed: u64,
    pub ignored: u64,
    pub reconnects: u64,
    pub connected: bool,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestCounters {
        IngestCounters {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
        }
    }
}

/// Délai avant la tentative `attempt` (1 = première reconnexion)
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1_u32 << exponent).min(max)
}

/// URL du flux, avec le jeton de session en paramètre `token`
pub fn stream_url(base: &str, token: Option<&str>) -> Result<String, ChartError> {
    let mut url =
        reqwest::Url::parse(base).map_err(|e| ChartError::Transport(format!("{}: {}", base, e)))?;
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url.into())
}

/// Ingestion des ticks d'une session
pub struct TickIngestor {
    config: StreamConfig,
    context: SessionContext,
    stats: Arc<IngestStats>,
    active: Option<(CancellationToken, JoinHandle<()>)>,
}

impl TickIngestor {
    pub fn new(config: StreamConfig, context: SessionContext) -> Self {
        Self {
            config,
            context,
            stats: Arc::new(IngestStats::default()),
            active: None,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Vrai si un abonnement est en cours
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|(cancel, handle)| !cancel.is_cancelled() && !handle.is_finished())
    }

    /// Ouvre l'abonnement du ticket ; l'abonnement précédent est fermé d'abord
    ///
    /// Doit être appelé dans le contexte d'un runtime tokio
    pub fn subscribe(&mut self, ticket: &LoadTicket, events: mpsc::Sender<EngineEvent>) {
        let previous = self.active.take().map(|(cancel, handle)| {
            cancel.cancel();
            handle
        });

        let cancel = ticket.cancel.clone();
        let task = StreamTask {
            config: self.config.clone(),
            context: self.context.clone(),
            symbol: ticket.binding.symbol.clone(),
            token: ticket.token,
            cancel: cancel.clone(),
            stats: Arc::clone(&self.stats),
            events,
        };

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            task.run().await;
        });

        info!(symbol = %ticket.binding.symbol, token = ticket.token.0, "Tick subscription opened");
        self.active = Some((cancel, handle));
    }

    /// Ferme l'abonnement en cours
    pub fn unsubscribe(&mut self) {
        if let Some((cancel, _)) = self.active.take() {
            cancel.cancel();
            debug!("Tick subscription closed");
        }
    }
}

impl Drop for TickIngestor {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// État d'une tâche d'abonnement
struct StreamTask {
    config: StreamConfig,
    context: SessionContext,
    symbol: String,
    token: RequestToken,
    cancel: CancellationToken,
    stats: Arc<IngestStats>,
    events: mpsc::Sender<EngineEvent>,
}

impl StreamTask {
    /// Boucle connexion / lecture / reconnexion
    async fn run(self) {
        let mut attempt = 0_u32;

        while !self.cancel.is_cancelled() {
            let url = match stream_url(&self.config.url, self.context.token().as_deref()) {
                Ok(url) => url,
                Err(e) => {
                    warn!(error = %e, "Invalid stream URL, subscription stopped");
                    return;
                }
            };

            let connection = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = connect_async(url.as_str()) => result,
            };

            match connection {
                Ok((mut websocket, _)) => {
                    attempt = 0;
                    self.stats.connected.store(true, Ordering::Relaxed);
                    info!(symbol = %self.symbol, "Price stream connected");

                    loop {
                        let frame = tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            next = websocket.next() => next,
                        };
                        let Some(frame) = frame else {
                            break;
                        };

                        let keep_going = match frame {
                            Ok(Message::Text(text)) => self.handle_text(&text),
                            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                                Ok(text) => self.handle_text(&text),
                                Err(_) => {
                                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                                    true
                                }
                            },
                            Ok(Message::Close(_)) => break,
                            Ok(_) => true,
                            Err(e) => {
                                warn!(error = %e, "Price stream frame error");
                                break;
                            }
                        };

                        if !keep_going {
                            // La boucle principale a disparu
                            self.cancel.cancel();
                            break;
                        }
                    }

                    self.stats.connected.store(false, Ordering::Relaxed);
                    if self.cancel.is_cancelled() {
                        let _ = websocket.close(None).await;
                        break;
                    }
                    warn!(symbol = %self.symbol, "Price stream disconnected");
                }
                Err(e) => {
                    let error = ChartError::Transport(e.to_string());
                    warn!(error = %error, attempt, "Price stream connection failed");
                }
            }

            attempt = attempt.saturating_add(1);
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            let delay =
                reconnect_delay(attempt, self.config.reconnect_base, self.config.reconnect_max);
            debug!(delay_ms = delay.as_millis() as u64, attempt, "Reconnecting price stream");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(symbol = %self.symbol, "Tick subscription task finished");
    }

    /// Traite un message texte ; retourne false si la boucle principale est fermée
    fn handle_text(&self, text: &str) -> bool {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        match parse_message(text) {
            Ok(WireMessage::Ticks { ticks, rejected }) => {
                for reason in rejected {
                    self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                    debug!(%reason, "Malformed tick dropped from trade batch");
                }
                for tick in ticks {
                    if tick.symbol != self.symbol {
                        self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    let event = EngineEvent::Tick {
                        token: self.token,
                        tick,
                    };
                    if self.events.send(event).is_err() {
                        return false;
                    }
                }
            }
            Ok(WireMessage::Control(kind)) => {
                self.stats.ignored.fetch_add(1, Ordering::Relaxed);
                trace!(%kind, "Control message ignored");
            }
            Err(reason) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(%reason, "Malformed stream message dropped");
            }
        }
        true
    }
}

// ============================================================================
// Tests unitaires
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::session::Binding;
    use crate::models::{Resolution, Tick};
    use futures_util::SinkExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_reconnect_delay_is_capped() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| reconnect_delay(attempt, base, max).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(reconnect_delay(u32::MAX, base, max), max);
    }

    #[test]
    fn test_stream_url_with_token() {
        assert_eq!(
            stream_url("ws://localhost:8000/ws/prices", None).unwrap(),
            "ws://localhost:8000/ws/prices"
        );
        assert_eq!(
            stream_url("ws://localhost:8000/ws/prices", Some("a b")).unwrap(),
            "ws://localhost:8000/ws/prices?token=a+b"
        );
        assert!(stream_url("not a url", None).is_err());
    }

    fn ticket(token: u64, symbol: &str) -> LoadTicket {
        LoadTicket {
            token: RequestToken(token),
            binding: Binding::new(symbol, Resolution::M5),
            cancel: CancellationToken::new(),
        }
    }

    fn ingestor(url: String) -> TickIngestor {
        let config = StreamConfig {
            url,
            reconnect_base: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(50),
        };
        TickIngestor::new(config, SessionContext::new("http://unused", None))
    }

    async fn next_event(rx: &mpsc::Receiver<EngineEvent>) -> EngineEvent {
        for _ in 0..500 {
            if let Ok(event) = rx.try_recv() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no event received");
    }

    fn expect_tick(event: EngineEvent) -> (RequestToken, Tick) {
        match event {
            EngineEvent::Tick { token, tick } => (token, tick),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ingestor_filters_and_counts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for text in [
                r#"{"s":"AAPL","p":100.0,"t":1000}"#,
                r#"{"s":"TSLA","p":200.0,"t":1000}"#,
                "garbage",
                r#"{"type":"alert_triggered","id":1}"#,
                r#"{"symbol":"AAPL","price":101.0,"timestamp":2}"#,
                r#"{"type":"trade","data":[{"s":"AAPL","p":-5.0,"t":3000},{"s":"AAPL","p":102.0,"t":3000}]}"#,
            ] {
                ws.send(Message::Text(text.to_string())).await.unwrap();
            }
            // Garde la connexion ouverte jusqu'à la fermeture par le client
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (tx, rx) = mpsc::channel();
        let mut ingestor = ingestor(url);
        ingestor.subscribe(&ticket(3, "AAPL"), tx);

        let (token, first) = expect_tick(next_event(&rx).await);
        assert_eq!(token, RequestToken(3));
        assert_eq!(first, Tick::new("AAPL", 100.0, 1));
        let (_, second) = expect_tick(next_event(&rx).await);
        assert_eq!(second.price, 101.0);
        // L'élément invalide du lot est écarté, le tick valide passe
        let (_, third) = expect_tick(next_event(&rx).await);
        assert_eq!(third.price, 102.0);

        let counters = ingestor.stats().snapshot();
        assert_eq!(counters.received, 6);
        assert_eq!(counters.delivered, 3);
        assert_eq!(counters.filtered, 1);
        assert_eq!(counters.malformed, 2);
        assert_eq!(counters.ignored, 1);
        assert!(counters.connected);

        ingestor.unsubscribe();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_ingestor_reconnects_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            // Première connexion coupée immédiatement
            let (stream, _) = listener.accept().await.unwrap();
            drop(accept_async(stream).await.unwrap());

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"s":"AAPL","p":5.0,"t":0}"#.to_string()))
                .await
                .unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (tx, rx) = mpsc::channel();
        let mut ingestor = ingestor(url);
        ingestor.subscribe(&ticket(1, "AAPL"), tx);

        let (_, tick) = expect_tick(next_event(&rx).await);
        assert_eq!(tick.price, 5.0);
        assert!(ingestor.stats().snapshot().reconnects >= 1);
        ingestor.unsubscribe();
    }

    #[tokio::test]
    async fn test_resubscribe_closes_previous() {
        let (tx, _rx) = mpsc::channel();
        // Port fermé : la tâche boucle en reconnexion
        let mut ingestor = ingestor("ws://127.0.0.1:9".to_string());

        let first = ticket(1, "AAPL");
        ingestor.subscribe(&first, tx.clone());
        let second = ticket(2, "TSLA");
        ingestor.subscribe(&second, tx);

        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());

        ingestor.unsubscribe();
        assert!(second.cancel.is_cancelled());
        assert!(!ingestor.is_active());
    }
}
