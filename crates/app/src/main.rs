//! Confab - peer-symmetric terminal chat
//!
//! One process runs with `--serve` and accepts everyone else; the
//! others connect to it. All state lives in memory and dies with the
//! process.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use confab_net::{transport, ChatService, Config, Event, EventBus, EventKind, Registry};

mod config;
mod ui;

use config::Args;
use ui::{Ui, UiCommand};

/// The terminal belongs to the TUI, so logs go to a file - and only
/// when the operator asked for them via RUST_LOG.
fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let Ok(file) = std::fs::File::create("confab.log") else {
        return;
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Bridge bus events into rendering commands for the UI task.
async fn wire_presentation(
    bus: &Arc<EventBus>,
    chat: &Arc<ChatService>,
) -> mpsc::UnboundedReceiver<UiCommand> {
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();

    let tx = ui_tx.clone();
    bus.subscribe(&[EventKind::ChatMessage], move |event| {
        let tx = tx.clone();
        async move {
            if let Event::ChatMessage { user, text } = event {
                let _ = tx.send(UiCommand::User { user, text });
            }
        }
    })
    .await;

    let tx = ui_tx.clone();
    bus.subscribe(&[EventKind::System], move |event| {
        let tx = tx.clone();
        async move {
            if let Event::System { text } = event {
                let _ = tx.send(UiCommand::System { text });
            }
        }
    })
    .await;

    let chat = chat.clone();
    bus.subscribe(&[EventKind::RosterUpdated], move |_| {
        let chat = chat.clone();
        let tx = ui_tx.clone();
        async move {
            let _ = tx.send(UiCommand::Roster {
                users: chat.users().await,
                self_id: chat.self_id().await,
            });
        }
    })
    .await;

    ui_rx
}

async fn run(config: Arc<Config>) -> i32 {
    let bus = Arc::new(EventBus::new());
    let registry = Arc::new(Registry::new(bus.clone()));
    let chat = ChatService::new(config.clone(), bus.clone(), registry.clone());
    chat.register().await;

    let ui_rx = wire_presentation(&bus, &chat).await;
    let ui = Ui::new(bus.clone(), ui_rx);

    // The transport task only resolves with a fatal error; a clean end
    // of the client connection leaves the transcript up for reading.
    let net_bus = bus.clone();
    let mut net = tokio::spawn(async move {
        match transport::run(config, registry, net_bus).await {
            Ok(()) => {
                info!("Networking finished");
                std::future::pending::<confab_net::Error>().await
            }
            Err(e) => e,
        }
    });

    tokio::select! {
        result = ui.run() => match result {
            Ok(()) => {
                info!("Operator quit");
                0
            }
            Err(e) => {
                ui::restore_terminal();
                eprintln!("confab: terminal error: {}", e);
                1
            }
        },
        result = &mut net => {
            ui::restore_terminal();
            match result {
                Ok(e) => {
                    error!(error = %e, "Fatal network error");
                    eprintln!("confab: {}", e);
                }
                Err(e) => {
                    warn!(error = %e, "Network task aborted");
                    eprintln!("confab: network task failed: {}", e);
                }
            }
            1
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing();

    let config = match args.into_config() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("confab: {}", e);
            std::process::exit(2);
        }
    };

    let code = run(config).await;
    std::process::exit(code);
}
