use std::time::Duration;

use anyhow::{Result, anyhow};
use tether_proto::{PeerEnvelope, Role};

use super::{
    Backoff, RawModeGuard, Session, SessionEvent, TERMINAL_READY, connect_and_register,
    handle_account_event, notice, spawn_stdin_reader, split_detach, terminal_size, write_stdout,
};
use crate::config::ClientConfig;
use crate::identity::StateStore;
use crate::signaling::SignalingClient;
use crate::transport::TransportError;
use crate::transport::webrtc::WebRtcConnector;

const RESIZE_POLL: Duration = Duration::from_millis(250);

enum Exit {
    Reconnect,
    Done,
    Failed(String),
}

/// What one turn of the select loop produced.
enum Step {
    Events(Vec<SessionEvent>),
    Quiet,
    Exit(Exit),
}

/// Attach to a host's shell. With a code the viewer redeems it once; without
/// one it relies on account pairing.
pub async fn run(config: ClientConfig, store: StateStore, code: Option<String>) -> Result<()> {
    let url = config.websocket_url()?;
    let _raw = RawModeGuard::new(true);
    let mut stdin = spawn_stdin_reader();
    let mut backoff = Backoff::default();
    let mut code = code.filter(|code| !code.trim().is_empty());

    loop {
        let (client, mut inbound) = match connect_and_register(&url, &store, Role::Viewer).await {
            Ok(connected) => connected,
            Err(err) => {
                let delay = backoff.next_delay();
                notice(format!("Relay unavailable ({err}), retrying in {}ms", delay.as_millis()));
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        backoff.reset();

        let (mut session, mut transport_events) = Session::new(
            Role::Viewer,
            WebRtcConnector::new(config.stun_urls.clone()),
            config.discovery_timeout,
            client.clone(),
        );
        let mut size = terminal_size();
        let mut resize_tick = tokio::time::interval(RESIZE_POLL);

        let exit = loop {
            let step = tokio::select! {
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => relay_failure(session.handle_server(envelope).await),
                    None => {
                        notice("Lost the relay connection, reconnecting");
                        Step::Exit(Exit::Reconnect)
                    }
                },
                Some(event) = transport_events.recv() => {
                    relay_failure(session.handle_transport(event).await)
                }
                input = stdin.recv() => match input {
                    Some(input) => {
                        let (data, detach) = split_detach(&input);
                        let mut step = Step::Quiet;
                        if !data.is_empty() && session.is_paired() {
                            let sent = session
                                .send(PeerEnvelope::TerminalInput { data: data.to_vec() })
                                .await;
                            step = relay_failure(sent.map(|_| Vec::new()));
                        }
                        if detach {
                            notice("Detached");
                            step = Step::Exit(Exit::Done);
                        }
                        step
                    }
                    None => Step::Exit(Exit::Done),
                },
                _ = resize_tick.tick() => {
                    let current = terminal_size();
                    if current != size {
                        size = current;
                        if session.is_paired() {
                            let sent = session
                                .send(PeerEnvelope::TerminalResize { cols: size.0, rows: size.1 })
                                .await;
                            relay_failure(sent.map(|_| Vec::new()))
                        } else {
                            Step::Quiet
                        }
                    } else {
                        Step::Quiet
                    }
                }
                _ = tokio::signal::ctrl_c() => Step::Exit(Exit::Done),
            };

            let events = match step {
                Step::Events(events) => events,
                Step::Quiet => continue,
                Step::Exit(exit) => break exit,
            };
            if let Some(exit) =
                dispatch(events, &session, &store, &client, &mut code, size)?
            {
                break exit;
            }
        };

        session.shutdown().await;
        match exit {
            Exit::Done => return Ok(()),
            Exit::Failed(message) => return Err(anyhow!(message)),
            Exit::Reconnect => {
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }
}

fn relay_failure(result: Result<Vec<SessionEvent>, TransportError>) -> Step {
    match result {
        Ok(events) => Step::Events(events),
        Err(err) => {
            tracing::warn!(target = "tether::viewer", error = %err, "relay send failed");
            Step::Exit(Exit::Reconnect)
        }
    }
}

/// Act on session events, whichever path they arrived on.
fn dispatch(
    events: Vec<SessionEvent>,
    session: &Session<WebRtcConnector>,
    store: &StateStore,
    client: &SignalingClient,
    code: &mut Option<String>,
    size: (u16, u16),
) -> Result<Option<Exit>> {
    for event in events {
        let Some(event) = handle_account_event(event, store, client, Role::Viewer)? else {
            continue;
        };
        match event {
            SessionEvent::Registered(message) => {
                notice(message);
                if let Some(code) = code.as_deref() {
                    client.pair(code, Some(size))?;
                }
            }
            SessionEvent::Paired { peer_id } => {
                // The code is spent; later registrations pair by account only.
                *code = None;
                notice(format!("Connected to host {peer_id}, press Ctrl-] to detach"));
            }
            SessionEvent::PeerLost => notice("Host disconnected, waiting"),
            SessionEvent::TerminalOutput(data) => write_stdout(&data),
            SessionEvent::System { kind, .. } if kind == TERMINAL_READY => {
                tracing::debug!(target = "tether::viewer", "host terminal ready");
            }
            SessionEvent::ServerError(message) => {
                if session.is_paired() {
                    notice(format!("Relay error: {message}"));
                } else {
                    return Ok(Some(Exit::Failed(message)));
                }
            }
            other => {
                tracing::trace!(target = "tether::viewer", event = ?other, "unhandled session event");
            }
        }
    }
    Ok(None)
}
