//! Turns terminal signals into [`Signal`]s for the runner.

use stratus_core::prelude::*;

use tokio::sync::mpsc;
use tracing::debug;

/// Forwards Ctrl-C as [`Signal::Interrupt`] and Ctrl-Z as [`Signal::Detach`] for the
/// rest of the process' life.
///
/// Installing the handlers replaces the default actions, so the process is neither
/// killed by Ctrl-C nor suspended by Ctrl-Z while a build is being watched.
#[cfg(unix)]
pub fn forward() -> std::io::Result<Signals> {
    use nix::sys::signal::Signal as Raw;
    use tokio::signal::unix::{SignalKind, signal};

    let (tx, rx) = mpsc::unbounded_channel();
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut suspend = signal(SignalKind::from_raw(Raw::SIGTSTP as i32))?;

    tokio::spawn(async move {
        loop {
            let forwarded = tokio::select! {
                Some(()) = interrupt.recv() => Signal::Interrupt,
                Some(()) = suspend.recv() => Signal::Detach,
                else => break,
            };
            debug!(?forwarded, "Received signal");
            if tx.send(forwarded).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

/// Ctrl-C only; there is no portable detach key.
#[cfg(not(unix))]
pub fn forward() -> std::io::Result<Signals> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            debug!("Received Ctrl-C");
            if tx.send(Signal::Interrupt).is_err() {
                break;
            }
        }
    });
    Ok(rx)
}
