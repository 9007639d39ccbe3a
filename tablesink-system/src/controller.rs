use std::io;
use std::sync::{LazyLock, OnceLock};
use std::time::Duration;

use tokio::sync::watch;

/// Timeout applied to graceful shutdowns when none has been configured.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shutdown request sent by the [`Controller`] to subscribed services.
///
/// A handler has to ensure that it doesn't take longer than `timeout` to resolve the future.
/// Ideally, open work is persisted or finished in an orderly manner but no new requests are
/// accepted anymore.
///
/// After the timeout the system will shut down regardless of what the receivers of this message
/// do.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Determines how to shut down the process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownMode {
    /// Shut down gracefully within the configured shutdown timeout.
    Graceful,
    /// Shut down immediately without finishing pending work.
    Immediate,
}

static SHUTDOWN: LazyLock<watch::Sender<Option<Shutdown>>> =
    LazyLock::new(|| watch::channel(None).0);

static SHUTDOWN_TIMEOUT: OnceLock<Duration> = OnceLock::new();

/// Notifies a service about an upcoming shutdown.
///
/// Obtain a handle through [`Controller::shutdown_handle`].
#[derive(Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Returns the current shutdown state, if a shutdown has been requested.
    pub fn get(&self) -> Option<Shutdown> {
        *self.0.borrow()
    }

    /// Waits for the next shutdown.
    ///
    /// Resolves once for every shutdown that is requested after the handle was created, or
    /// immediately if a shutdown was already in progress when the handle was created.
    pub async fn notified(&mut self) -> Shutdown {
        while self.0.changed().await.is_ok() {
            if let Some(shutdown) = *self.0.borrow_and_update() {
                return shutdown;
            }
        }

        // The sender is static and never dropped.
        std::future::pending().await
    }
}

/// Service to start and gracefully stop the system runtime.
///
/// This service offers a static API to wait for a shutdown signal or manually initiate the
/// shutdown. Services subscribe to shutdowns through [`Controller::shutdown_handle`] and receive
/// a [`Shutdown`] with an optional timeout.
///
/// ### Example
///
/// ```
/// use std::time::Duration;
/// use tablesink_system::{Controller, Shutdown, ShutdownMode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// Controller::start(Duration::from_millis(10));
///
/// tokio::spawn(async move {
///     let Shutdown { timeout } = Controller::shutdown_handle().notified().await;
///     // Finish pending work within `timeout` here.
/// });
///
/// Controller::shutdown(ShutdownMode::Immediate);
/// # }
/// ```
#[derive(Debug)]
pub struct Controller;

impl Controller {
    /// Starts the controller with the given graceful shutdown timeout.
    ///
    /// The controller listens for process signals: `SIGINT` and `SIGTERM` start a graceful
    /// shutdown, `SIGQUIT` an immediate one.
    pub fn start(shutdown_timeout: Duration) {
        SHUTDOWN_TIMEOUT.set(shutdown_timeout).ok();
        tokio::spawn(async {
            if let Err(error) = monitor_shutdown().await {
                tablesink_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to listen for process signals"
                );
            }
        });
    }

    /// Returns a handle to receive the next shutdown.
    pub fn shutdown_handle() -> ShutdownHandle {
        let mut receiver = SHUTDOWN.subscribe();
        if receiver.borrow().is_some() {
            receiver.mark_changed();
        }
        ShutdownHandle(receiver)
    }

    /// Manually initiates the shutdown process of the system.
    pub fn shutdown(mode: ShutdownMode) {
        let timeout = match mode {
            ShutdownMode::Immediate => None,
            ShutdownMode::Graceful => Some(
                SHUTDOWN_TIMEOUT
                    .get()
                    .copied()
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
            ),
        };

        SHUTDOWN.send_replace(Some(Shutdown { timeout }));
    }
}

#[cfg(unix)]
async fn monitor_shutdown() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_quit = signal(SignalKind::quit())?;
    let mut sig_term = signal(SignalKind::terminate())?;

    loop {
        let mode = tokio::select! {
            biased;

            Some(()) = sig_quit.recv() => {
                tablesink_log::info!("SIGQUIT received, exiting immediately");
                ShutdownMode::Immediate
            }
            Some(()) = sig_int.recv() => {
                tablesink_log::info!("SIGINT received, shutting down");
                ShutdownMode::Graceful
            }
            Some(()) = sig_term.recv() => {
                tablesink_log::info!("SIGTERM received, shutting down");
                ShutdownMode::Graceful
            }

            else => break,
        };

        Controller::shutdown(mode);
    }

    Ok(())
}

#[cfg(not(unix))]
async fn monitor_shutdown() -> io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        tablesink_log::info!("SIGINT received, shutting down");
        Controller::shutdown(ShutdownMode::Graceful);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // All assertions on the global shutdown state live in one test, since the state is shared by
    // the whole test binary.
    #[tokio::test]
    async fn test_shutdown_handles() {
        tablesink_log::init_test!();

        let mut early = Controller::shutdown_handle();
        assert_eq!(early.get(), None);

        Controller::shutdown(ShutdownMode::Graceful);
        assert_eq!(
            early.notified().await,
            Shutdown {
                timeout: Some(DEFAULT_SHUTDOWN_TIMEOUT)
            }
        );

        // Handles created after the shutdown still observe it.
        let mut late = Controller::shutdown_handle();
        assert_eq!(
            late.notified().await.timeout,
            Some(DEFAULT_SHUTDOWN_TIMEOUT)
        );

        Controller::shutdown(ShutdownMode::Immediate);
        assert_eq!(early.notified().await, Shutdown { timeout: None });
    }
}
