use std::time::Duration;

use anyhow::{Context, Result};
use tether_proto::{PeerEnvelope, Role};

use super::{
    Backoff, RawModeGuard, Session, SessionEvent, TERMINAL_READY, connect_and_register,
    handle_account_event, notice, spawn_stdin_reader, split_detach, terminal_size, write_stdout,
};
use crate::config::ClientConfig;
use crate::identity::StateStore;
use crate::signaling::SignalingClient;
use crate::terminal::{OutputBacklog, Pty};
use crate::transport::TransportError;
use crate::transport::webrtc::WebRtcConnector;

const RESIZE_POLL: Duration = Duration::from_millis(250);

enum Exit {
    Reconnect,
    Done,
}

/// What one turn of the select loop produced.
enum Step {
    Events(Vec<SessionEvent>),
    Quiet,
    Exit(Exit),
}

/// Share a local shell. The shell outlives individual viewers and control
/// connections; the session ends when the shell exits or on Ctrl-].
pub async fn run(config: ClientConfig, store: StateStore) -> Result<()> {
    let url = config.websocket_url()?;
    let (cols, rows) = terminal_size();
    let (pty, mut pty_output) =
        Pty::spawn(Pty::default_shell(), cols, rows).context("failed to start shell")?;
    let _raw = RawModeGuard::new(true);
    let mut stdin = spawn_stdin_reader();
    let mut backlog = OutputBacklog::default();
    let mut backoff = Backoff::default();
    let mut local_size = (cols, rows);

    loop {
        let (client, mut inbound) = match connect_and_register(&url, &store, Role::Host).await {
            Ok(connected) => connected,
            Err(err) => {
                let delay = backoff.next_delay();
                notice(format!("Relay unavailable ({err}), retrying in {}ms", delay.as_millis()));
                if wait_or_detach(delay, &pty, &mut pty_output, &mut stdin, &mut backlog).await {
                    return Ok(());
                }
                continue;
            }
        };
        backoff.reset();

        let (mut session, mut transport_events) = Session::new(
            Role::Host,
            WebRtcConnector::new(config.stun_urls.clone()),
            config.discovery_timeout,
            client.clone(),
        );
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
                chunk = pty_output.recv() => match chunk {
                    Some(chunk) => {
                        write_stdout(&chunk);
                        if session.is_paired() {
                            let sent = session.send(PeerEnvelope::TerminalOutput { data: chunk }).await;
                            relay_failure(sent.map(|_| Vec::new()))
                        } else {
                            backlog.push(&chunk);
                            Step::Quiet
                        }
                    }
                    None => {
                        notice("Shell exited");
                        Step::Exit(Exit::Done)
                    }
                },
                input = stdin.recv() => match input {
                    Some(input) => {
                        let (data, detach) = split_detach(&input);
                        if !data.is_empty() {
                            if let Err(err) = pty.write(data) {
                                tracing::warn!(target = "tether::host", error = %err, "pty write failed");
                            }
                        }
                        if detach {
                            notice("Detached");
                            Step::Exit(Exit::Done)
                        } else {
                            Step::Quiet
                        }
                    }
                    None => Step::Exit(Exit::Done),
                },
                _ = resize_tick.tick() => {
                    // Follow the local terminal only while nobody is viewing.
                    let size = terminal_size();
                    if size != local_size && !session.is_paired() {
                        local_size = size;
                        let _ = pty.resize(size.0, size.1);
                    }
                    Step::Quiet
                }
                _ = tokio::signal::ctrl_c() => Step::Exit(Exit::Done),
            };

            let events = match step {
                Step::Events(events) => events,
                Step::Quiet => continue,
                Step::Exit(exit) => break exit,
            };
            if let Some(exit) =
                dispatch(events, &mut session, &pty, &mut backlog, &store, &client).await?
            {
                break exit;
            }
        };

        session.shutdown().await;
        match exit {
            Exit::Done => {
                pty.kill();
                return Ok(());
            }
            Exit::Reconnect => {
                let delay = backoff.next_delay();
                if wait_or_detach(delay, &pty, &mut pty_output, &mut stdin, &mut backlog).await {
                    return Ok(());
                }
            }
        }
    }
}

fn relay_failure(result: Result<Vec<SessionEvent>, TransportError>) -> Step {
    match result {
        Ok(events) => Step::Events(events),
        Err(err) => {
            tracing::warn!(target = "tether::host", error = %err, "relay send failed");
            Step::Exit(Exit::Reconnect)
        }
    }
}

/// Act on session events, whichever path they arrived on.
async fn dispatch(
    events: Vec<SessionEvent>,
    session: &mut Session<WebRtcConnector>,
    pty: &Pty,
    backlog: &mut OutputBacklog,
    store: &StateStore,
    client: &SignalingClient,
) -> Result<Option<Exit>> {
    for event in events {
        let Some(event) = handle_account_event(event, store, client, Role::Host)? else {
            continue;
        };
        match event {
            SessionEvent::Registered(message) => notice(message),
            SessionEvent::PairingCode(code) => {
                notice(format!("Pairing code: {code}  (share it with the viewer)"));
            }
            SessionEvent::Paired { peer_id } => {
                notice(format!("Viewer {peer_id} connected"));
                if let Err(err) = session.send(PeerEnvelope::system(TERMINAL_READY)).await {
                    tracing::warn!(target = "tether::host", error = %err, "ready notice failed");
                    return Ok(Some(Exit::Reconnect));
                }
                if !backlog.is_empty() {
                    let flushed = session
                        .send(PeerEnvelope::TerminalOutput { data: backlog.take() })
                        .await;
                    if let Err(err) = flushed {
                        tracing::warn!(target = "tether::host", error = %err, "backlog flush failed");
                        return Ok(Some(Exit::Reconnect));
                    }
                }
            }
            SessionEvent::PeerLost => {
                notice("Viewer disconnected");
                let state = store.load_or_create(Role::Host)?;
                client.register(Role::Host, &state.device_id, state.token)?;
            }
            SessionEvent::CodeExpired => {
                notice("Pairing code expired, requesting a new one");
                let state = store.load_or_create(Role::Host)?;
                client.register(Role::Host, &state.device_id, state.token)?;
            }
            SessionEvent::TerminalInput(data) => {
                if let Err(err) = pty.write(&data) {
                    tracing::warn!(target = "tether::host", error = %err, "pty write failed");
                }
            }
            SessionEvent::Resize { cols, rows } => {
                if let Err(err) = pty.resize(cols, rows) {
                    tracing::debug!(target = "tether::host", error = %err, "pty resize rejected");
                }
            }
            SessionEvent::ServerError(message) => notice(format!("Relay error: {message}")),
            other => {
                tracing::trace!(target = "tether::host", event = ?other, "unhandled session event");
            }
        }
    }
    Ok(None)
}

/// Keep the shell usable locally while waiting to reconnect. Returns true if
/// the session should end.
async fn wait_or_detach(
    delay: Duration,
    pty: &Pty,
    pty_output: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    stdin: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    backlog: &mut OutputBacklog,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            chunk = pty_output.recv() => match chunk {
                Some(chunk) => {
                    write_stdout(&chunk);
                    backlog.push(&chunk);
                }
                None => return true,
            },
            input = stdin.recv() => {
                let Some(input) = input else { return true };
                let (data, detach) = split_detach(&input);
                if !data.is_empty() {
                    let _ = pty.write(data);
                }
                if detach {
                    pty.kill();
                    return true;
                }
            }
        }
    }
}
