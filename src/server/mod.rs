//! Admin HTTP surface: health/ready/metrics/debug endpoints only, structured
//! like the teacher's own admin server (`hyper` + `hyper_util::server::conn::auto`,
//! no router crate).

mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::AdminState;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Runs the admin HTTP server until `shutdown` is notified.
pub async fn run_admin_server(listen: &str, state: AdminState, shutdown: std::sync::Arc<Notify>) -> anyhow::Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: admin: stop accepting new connections");
                return Ok(());
            }
        };

        let (stream, _) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: admin: accept failed, error={}", e);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
