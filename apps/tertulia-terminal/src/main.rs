mod config;
mod input;
mod logging;
mod state;

use std::{
    io::{self, Write},
    process::ExitCode,
    sync::{Arc, Mutex},
    time::Duration,
};

use config::{ROOMS, TerminalConfig};
use input::{HELP_TEXT, InputAction, parse_line};
use state::{ChatSnapshot, ChatViewState};
use tertulia_core::ChatEvent;
use tertulia_platform::{FileKeyValueStore, KeyValueStore, ScopedKeyValueStore};
use tertulia_sync::{ChatRuntimeHandle, InMemoryBackend, SendRequestError, spawn_runtime};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type SharedState = Arc<Mutex<ChatViewState>>;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting tertulia-terminal");

    let config = match TerminalConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "terminal config invalid");
            eprintln!("configuración inválida: {err}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        user_id = %config.viewer.user_id,
        data_dir = %config.data_dir.display(),
        history_limit = config.runtime.history_limit,
        auto_reply = config.runtime.auto_reply.is_some(),
        "terminal config loaded"
    );

    let store = match FileKeyValueStore::open(config.data_dir.clone()) {
        Ok(file) => {
            Arc::new(ScopedKeyValueStore::new(file, config.store_namespace()))
                as Arc<dyn KeyValueStore>
        }
        Err(err) => {
            error!(error = %err, "pending store unavailable");
            eprintln!("no se pudo abrir {}: {err}", config.data_dir.display());
            return ExitCode::FAILURE;
        }
    };

    let handle = spawn_runtime(
        Arc::new(InMemoryBackend::new()),
        store,
        config.viewer.clone(),
        config.runtime.clone(),
    );
    let state: SharedState = Arc::new(Mutex::new(ChatViewState::new(
        config.viewer.user_id.clone(),
    )));
    let render_task = spawn_renderer(handle.subscribe(), Arc::clone(&state));

    println!("{HELP_TEXT}");
    if let Err(err) = join_room(&handle, &state, &config.initial_room).await {
        error!(error = %err, "runtime stopped before the first room");
        return ExitCode::FAILURE;
    }

    let exit = run_input_loop(&handle, &state).await;

    if let Err(err) = handle.shutdown().await {
        debug!(error = %err, "runtime already stopped");
    }
    drop(handle);
    if tokio::time::timeout(SHUTDOWN_GRACE, render_task)
        .await
        .is_err()
    {
        warn!("renderer did not stop in time");
    }
    info!("tertulia-terminal exited");
    exit
}

async fn run_input_loop(handle: &ChatRuntimeHandle, state: &SharedState) -> ExitCode {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed");
                return ExitCode::SUCCESS;
            }
            Err(err) => {
                error!(error = %err, "failed reading stdin");
                return ExitCode::FAILURE;
            }
        };

        let action = match parse_line(&line) {
            Ok(action) => action,
            Err(err) => {
                println!("! {err}");
                continue;
            }
        };
        let outcome = match action {
            InputAction::Nothing => Ok(()),
            InputAction::Help => {
                println!("{HELP_TEXT}");
                Ok(())
            }
            InputAction::ListRooms => {
                let selected = lock(state).selected_room().map(str::to_owned);
                for room in ROOMS {
                    let marker = if selected.as_deref() == Some(*room) { '*' } else { ' ' };
                    println!("{marker} {room}");
                }
                Ok(())
            }
            InputAction::Join(room) => join_room(handle, state, &room).await,
            InputAction::Leave => handle.leave_room().await.map_err(SendRequestError::from),
            InputAction::Retry(message_id) => {
                handle.retry(message_id).await.map_err(SendRequestError::from)
            }
            InputAction::Send(text) => {
                let result = handle.send_text(text).await;
                track_send(state, result)
            }
            InputAction::Media { kind, url, caption } => {
                let result = handle.send_media(url, kind, caption).await;
                track_send(state, result)
            }
            InputAction::Quit => {
                info!("quit requested from input");
                if lock(state).has_pending_sends() {
                    println!("hay envíos sin confirmar; quedan guardados y se pueden reintentar con /retry");
                }
                return ExitCode::SUCCESS;
            }
        };

        match outcome {
            Ok(()) => {}
            Err(SendRequestError::Validation(err)) => println!("! {err}"),
            Err(err @ SendRequestError::ChannelClosed) => {
                error!(error = %err, "runtime stopped");
                return ExitCode::FAILURE;
            }
        }
    }
}

async fn join_room(
    handle: &ChatRuntimeHandle,
    state: &SharedState,
    room: &str,
) -> Result<(), SendRequestError> {
    let room = room.trim();
    lock(state).select_room(room);
    handle.switch_room(room).await?;
    Ok(())
}

fn track_send(
    state: &SharedState,
    result: Result<String, SendRequestError>,
) -> Result<(), SendRequestError> {
    let client_txn_id = result?;
    lock(state).mark_send_requested(client_txn_id);
    Ok(())
}

fn spawn_renderer(mut events: broadcast::Receiver<ChatEvent>, state: SharedState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_rendered: Option<ChatSnapshot> = None;
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "renderer lagged behind runtime events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let snapshot = {
                let mut state = lock(&state);
                state.handle_event(event);
                state.snapshot()
            };
            if last_rendered.as_ref() != Some(&snapshot) {
                render(&snapshot);
                last_rendered = Some(snapshot);
            }
        }
        debug!("renderer stopped");
    })
}

fn render(snapshot: &ChatSnapshot) {
    let mut out = io::stdout().lock();
    let room = snapshot.selected_room.as_deref().unwrap_or("-");
    let _ = writeln!(out, "\n── {room} · {} ──", snapshot.status_text);
    for message in &snapshot.messages {
        let own = if message.is_own { " (tú)" } else { "" };
        if message.delivery_label.is_empty() {
            let _ = writeln!(out, "{}{own}: {}", message.author, message.text);
        } else {
            let _ = writeln!(
                out,
                "{}{own}: {} [{} · {}]",
                message.author, message.text, message.delivery_label, message.id
            );
        }
    }
    if let Some(error_text) = &snapshot.error_text {
        let _ = writeln!(out, "! {error_text}");
    }
    let _ = out.flush();
}

fn lock(state: &SharedState) -> std::sync::MutexGuard<'_, ChatViewState> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
