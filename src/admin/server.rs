//! Raw hyper http1 accept loop for the observability sidecar: one accept
//! loop, one task per connection.

use super::api::AdminApi;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub struct AdminServer {
    api: Arc<AdminApi>,
    address: SocketAddr,
}

impl AdminServer {
    pub fn new(api: AdminApi, address: SocketAddr) -> Self {
        Self {
            api: Arc::new(api),
            address,
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.address).await?;
        info!(address = %self.address, "admin sidecar listening");

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "admin accept failed");
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let api = Arc::clone(&self.api);

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let api = Arc::clone(&api);
                    async move {
                        debug!(method = %req.method(), path = %req.uri().path(), "admin request");
                        Ok::<_, hyper::Error>(api.handle(req).await)
                    }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(remote_addr = %remote_addr, error = %e, "admin connection error");
                }
            });
        }
    }
}
