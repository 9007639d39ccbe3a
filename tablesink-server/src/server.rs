use std::future::IntoFuture;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use axum::Router;
use tablesink_config::Config;
use tablesink_statsd::metric;
use tablesink_system::{Controller, Receiver, Service, Shutdown};
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::endpoints;
use crate::service::ServiceState;
use crate::statsd::ServerCounters;

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding failed.
    #[error("bind to interface failed")]
    BindFailed(#[from] std::io::Error),
}

/// Build the axum application with all routes and middleware.
fn make_app(service: ServiceState) -> Router {
    // Requests pass the layers from top to bottom, responses from bottom to top.
    let middleware = ServiceBuilder::new()
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http());

    let router = endpoints::routes(service.config());
    router.layer(middleware).with_state(service)
}

fn listen(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::from_std(listener)?;

    let (timeout_tx, timeout_rx) = oneshot::channel();
    let mut shutdown = Controller::shutdown_handle();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let Shutdown { timeout } = shutdown.notified().await;
        tablesink_log::info!("shutting down http server");
        timeout_tx.send(timeout).ok();
    });

    // Open connections may delay a graceful shutdown up to its timeout.
    let deadline = async move {
        match timeout_rx.await {
            Ok(Some(timeout)) => tokio::time::sleep(timeout).await,
            Ok(None) => (),
            Err(_) => std::future::pending().await,
        }
    };

    tokio::select! {
        result = server.into_future() => result,
        () = deadline => {
            tablesink_log::warn!("closing open connections");
            Ok(())
        }
    }
}

/// HTTP server service.
///
/// Receives OTLP metrics and hands them to the exporter of the [`ServiceState`]. The server
/// stops when a [`Shutdown`] is triggered.
pub struct HttpServer {
    config: Arc<Config>,
    service: ServiceState,
    listener: TcpListener,
}

impl HttpServer {
    /// Binds the listen address of the configuration.
    pub fn new(config: Arc<Config>, service: ServiceState) -> Result<Self, ServerError> {
        let listener = listen(config.listen_addr())?;

        Ok(Self {
            config,
            service,
            listener,
        })
    }

    /// Returns the address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Service for HttpServer {
    type Interface = ();

    async fn run(self, _rx: Receiver<Self::Interface>) {
        let Self {
            config,
            service,
            listener,
        } = self;

        let listen_addr = listener
            .local_addr()
            .unwrap_or_else(|_| config.listen_addr());

        tablesink_log::info!("spawning http server");
        tablesink_log::info!("  listening on http://{listen_addr}/");
        metric!(counter(ServerCounters::ServerStarting) += 1);

        let app = make_app(service);
        if let Err(error) = serve(listener, app).await {
            tablesink_log::error!(
                error = &error as &dyn std::error::Error,
                "http server failed"
            );
        }
    }
}
