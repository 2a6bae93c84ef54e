use crate::http::Gateway;
use anyhow::Result;
use hyper::server::conn::http1;
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, info_span, instrument, warn, Instrument};


/// Accepts gateway connections until the shutdown signal fires.
///
/// Connections that are open at shutdown are closed gracefully: in-flight
/// requests complete and watch streams end on the same signal.
#[instrument(skip_all, fields(port = %addr.port()))]
pub(crate) async fn serve(
    addr: SocketAddr,
    listener: TcpListener,
    gateway: Gateway,
    drain: drain::Watch,
) -> Result<()> {
    info!(%addr, "gateway HTTP server listening");

    let shutdown = drain.clone().signaled();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, client) = match accepted {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "Failed to accept connection");
                        continue;
                    }
                };
                tokio::spawn(
                    connection(stream, gateway.clone(), drain.clone())
                        .instrument(info_span!("conn", %client)),
                );
            }
            handle = &mut shutdown => {
                debug!("Shutting down");
                drop(listener);
                drop(handle);
                return Ok(());
            }
        }
    }
}

async fn connection(stream: TcpStream, gateway: Gateway, drain: drain::Watch) {
    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(gateway));
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(error) = res {
                debug!(%error, "Connection closed");
            }
        }
        handle = drain.signaled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(error) = handle.release_after(conn).await {
                debug!(%error, "Connection closed during shutdown");
            }
        }
    }
}
