use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpResponse, HttpServer, web};
use tokio::sync::watch;

use super::{HealthStatus, metrics};

type StatusRx = watch::Receiver<Arc<HealthStatus>>;

/// `/status`, `/metrics` and `/healthz` on a dedicated thread with its own actix system.
pub struct StatusServer {
    handle: ServerHandle,
    addrs: Vec<SocketAddr>,
    thread: Option<JoinHandle<()>>,
}

impl StatusServer {
    pub fn start(endpoint: &str, status: StatusRx) -> std::io::Result<Self> {
        let endpoint = endpoint.to_string();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("cdc-status".into())
            .spawn(move || {
                actix_web::rt::System::new().block_on(async move {
                    let data = web::Data::new(status);
                    let bound = HttpServer::new(move || {
                        App::new()
                            .app_data(data.clone())
                            .route("/status", web::get().to(status_json))
                            .route("/metrics", web::get().to(metrics_text))
                            .route("/healthz", web::get().to(healthz))
                    })
                    .workers(1)
                    .disable_signals()
                    .bind(&endpoint);
                    let bound = match bound {
                        Ok(bound) => bound,
                        Err(e) => {
                            if ready_tx.send(Err(e)).is_err() {
                                log::debug!(target: "cdc::health", "status server caller gone before bind error");
                            }
                            return;
                        }
                    };
                    let addrs = bound.addrs();
                    let server = bound.run();
                    if ready_tx.send(Ok((server.handle(), addrs))).is_err() {
                        log::debug!(target: "cdc::health", "status server caller gone before ready");
                    }
                    if let Err(e) = server.await {
                        log::error!(target: "cdc::health", "status server error: {}", e);
                    }
                })
            })?;
        let (handle, addrs) = ready_rx
            .recv()
            .map_err(|_| std::io::Error::other("status server thread exited"))??;
        log::info!(target: "cdc::health", "status server listening on {:?}", addrs);
        Ok(Self {
            handle,
            addrs,
            thread: Some(thread),
        })
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub async fn stop(mut self) {
        self.handle.stop(true).await;
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => log::debug!(target: "cdc::health", "status server thread panicked"),
                Err(e) => log::debug!(target: "cdc::health", "status server join fail: {}", e),
            }
        }
    }
}

async fn status_json(status: web::Data<StatusRx>) -> HttpResponse {
    let snapshot = status.borrow().clone();
    HttpResponse::Ok().json(snapshot.as_ref())
}

async fn metrics_text() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::render())
}

async fn healthz(status: web::Data<StatusRx>) -> HttpResponse {
    if status.borrow().healthy {
        HttpResponse::Ok().body("ok")
    } else {
        HttpResponse::ServiceUnavailable().body("degraded")
    }
}
