//! Health probe HTTP endpoints
//!
//! - `GET /healthz`: 200 once the host-facing gRPC server is serving, 503 otherwise
//! - `GET /leader`: leadership and membership summary as JSON

use std::sync::Arc;

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::service::PlacementService;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub id: String,
    pub is_leader: bool,
    pub leader_id: Option<String>,
    pub members: usize,
    pub table_generation: u64,
    pub streams: usize,
}

/// Shared handler state
#[derive(Debug, Clone)]
pub struct HealthState {
    pub node_id: String,
    pub service: Arc<PlacementService>,
}

pub async fn healthz_handler(state: web::Data<HealthState>) -> impl Responder {
    if state.service.is_serving() {
        HttpResponse::Ok().json(HealthResponse {
            status: "ok".to_string(),
        })
    } else {
        HttpResponse::ServiceUnavailable().json(HealthResponse {
            status: "starting".to_string(),
        })
    }
}

pub async fn leader_handler(state: web::Data<HealthState>) -> impl Responder {
    let fsm = state.service.fsm();
    HttpResponse::Ok().json(LeaderResponse {
        id: state.node_id.clone(),
        is_leader: state.service.has_leadership(),
        leader_id: state.service.executor().leader_hint(),
        members: fsm.member_count(),
        table_generation: fsm.table_generation(),
        streams: state.service.stream_count(),
    })
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(healthz_handler))
        .route("/leader", web::get().to(leader_handler));
}

/// Serve the probe endpoints on `0.0.0.0:port` until `shutdown` fires
pub async fn run_healthz_server(
    state: HealthState,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let data = web::Data::new(state);
    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
        .workers(1)
        .disable_signals()
        .bind(("0.0.0.0", port))?
        .run();

    let handle = server.handle();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        handle.stop(true).await;
    });

    log::info!("Healthz server listening on 0.0.0.0:{}", port);
    server.await?;
    log::info!("Healthz server stopped");
    Ok(())
}
