use anyhow::Result;
use env_logger::Env;
use log::{debug, error, info};
use neopult::{
    config,
    events::Event,
    lua::runtime::ScriptRuntime,
    registry::Notification,
    server,
    wm::WindowManager,
    ShutdownChannels,
};
use std::{process, sync::Arc};
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    signal,
    signal::unix::{signal as unix_signal, SignalKind},
    sync::{broadcast, mpsc, oneshot},
};

/// Line-oriented debug client on the host process stdin.
///
/// Understands `actions`, `statuses` and `call <instance::module::action>`,
/// and echoes registry notifications, so a channel can be driven without a
/// browser.
async fn terminal_client(
    event_tx: mpsc::Sender<Event>,
    notification_tx: broadcast::Sender<Notification>,
) {
    let stdin = io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut notification_rx = notification_tx.subscribe();

    loop {
        tokio::select!(
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        if event_tx
                            .send(Event::CliCommand { line, reply_tx })
                            .await
                            .is_err()
                        {
                            break;
                        }
                        match reply_rx.await {
                            Ok(reply) => println!("{reply}"),
                            Err(_) => println!("no reply"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => error!("error reading stdin: {e}"),
                }
            },
            notification = notification_rx.recv() => {
                if let Ok(notification) = notification {
                    match serde_json::to_string(&notification) {
                        Ok(json) => println!("notification: {json}"),
                        Err(e) => error!("couldn't serialize notification: {e}"),
                    }
                }
            },
        );
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let env_config = config::from_env()?;

    let (event_tx, event_rx) = mpsc::channel(64);
    let (notification_tx, _) = broadcast::channel(64);

    let (shutdown_wait_tx, mut shutdown_wait_rx) = mpsc::channel::<()>(1);
    let (shutdown_tx, _) = broadcast::channel(1);
    let shutdown_channels = ShutdownChannels {
        shutdown_tx: shutdown_tx.clone(),
        shutdown_wait_tx,
    };

    let window_manager = match WindowManager::init() {
        Ok(wm) => wm,
        Err(e) => {
            error!("couldn't initialize the window manager: {e:#}");
            process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let exit_code = runtime.block_on(async {
        window_manager.start_event_pump(event_tx.clone());

        // The script runtime owns a nested current-thread runtime for
        // blocking calls, which cannot be created inside an async context,
        // so init and the event loop run on a blocking thread.
        let (config_tx, config_rx) = oneshot::channel();
        let mut loop_handle = tokio::task::spawn_blocking({
            let io_handle = tokio::runtime::Handle::current();
            let shutdown_channels = shutdown_channels.clone();
            let event_tx = event_tx.clone();
            let notification_tx = notification_tx.clone();
            move || -> Result<()> {
                let script_runtime = ScriptRuntime::init(
                    io_handle,
                    env_config,
                    shutdown_channels,
                    event_tx,
                    event_rx,
                    notification_tx,
                    window_manager,
                )?;
                let config = script_runtime.config()?;
                let _ = config_tx.send(Arc::new(config));
                script_runtime.event_loop()
            }
        });

        let config = match config_rx.await {
            Ok(config) => config,
            Err(_) => {
                // Script init failed; the join below reports why.
                match loop_handle.await {
                    Ok(Err(e)) => error!("script runtime failed to start: {e:#}"),
                    Ok(Ok(())) => error!("script runtime exited before providing a config"),
                    Err(e) => error!("script runtime panicked: {e}"),
                }
                return 1;
            }
        };

        let mut server_handle = tokio::spawn(server::start(
            config,
            event_tx.clone(),
            notification_tx.clone(),
        ));
        let terminal_handle = tokio::spawn(terminal_client(event_tx, notification_tx));

        // Without this, waiting for shutdown would hang on our own clone.
        drop(shutdown_channels.shutdown_wait_tx);

        let mut sigterm = match unix_signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("couldn't install the SIGTERM handler: {e}");
                return 1;
            }
        };

        tokio::select!(
            join_result = &mut loop_handle => {
                server_handle.abort();
                terminal_handle.abort();
                match join_result {
                    Ok(Ok(())) => {
                        info!("event loop exited");
                        0
                    }
                    Ok(Err(e)) => {
                        error!("event loop exited with error: {e:#}");
                        1
                    }
                    Err(e) => {
                        error!("event loop panicked: {e}");
                        1
                    }
                }
            },
            join_result = &mut server_handle => {
                loop_handle.abort();
                terminal_handle.abort();
                match join_result {
                    Ok(Ok(())) => error!("admin server exited unexpectedly"),
                    Ok(Err(e)) => error!("admin server exited with error: {e:#}"),
                    Err(e) => error!("admin server panicked: {e}"),
                }
                1
            },
            _ = signal::ctrl_c() => {
                info!("got ctrl-c, shutting down (press ctrl-c again to force)");
                let _ = shutdown_tx.send(());
                tokio::select!(
                    _ = shutdown_wait_rx.recv() => debug!("graceful shutdown complete"),
                    _ = signal::ctrl_c() => info!("forced shutdown"),
                );
                0
            },
            _ = sigterm.recv() => {
                info!("got SIGTERM, shutting down");
                let _ = shutdown_tx.send(());
                let _ = shutdown_wait_rx.recv().await;
                0
            },
        )
    });

    process::exit(exit_code);
}
