//! Host stream termination

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use placement_commons::proto::{self, placement_server::Placement};
use placement_raft::Member;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use crate::service::{now_unix_nanos, MembershipChange, OrderSender, PlacementService, StreamConn};

/// Order buffer per stream; one rebalance needs three slots
const ORDER_BUFFER: usize = 16;

/// `Placement` gRPC implementation backed by a shared [`PlacementService`]
#[derive(Debug, Clone)]
pub struct PlacementHandler {
    service: Arc<PlacementService>,
}

impl PlacementHandler {
    pub fn new(service: Arc<PlacementService>) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl Placement for PlacementHandler {
    type ReportAppStatusStream = ReceiverStream<Result<proto::PlacementOrder, Status>>;

    async fn report_app_status(
        &self,
        request: Request<Streaming<proto::Host>>,
    ) -> Result<Response<Self::ReportAppStatusStream>, Status> {
        if self.service.shutdown.is_cancelled() {
            return Err(Status::unavailable("placement service shutting down"));
        }

        let remote = request.remote_addr();
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(ORDER_BUFFER);
        let stream_id = self.service.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.service.shutdown.child_token();

        log::debug!("Host stream {} opened from {:?}", stream_id, remote);
        tokio::spawn(self.service.clone().handle_stream(stream_id, inbound, tx, cancel));

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

impl PlacementService {
    async fn handle_stream(
        self: Arc<Self>,
        stream_id: u64,
        mut inbound: Streaming<proto::Host>,
        tx: OrderSender,
        cancel: CancellationToken,
    ) {
        // Last member proposed from this stream
        let mut reported: Option<Member> = None;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = inbound.message() => msg,
            };

            let host = match next {
                Ok(Some(host)) => host,
                Ok(None) => {
                    // Graceful close: the host leaves the rings on the next tick
                    if let Some(member) = reported.take() {
                        log::info!("Host {} closed its stream", member.name);
                        self.last_heartbeat.remove(&member.name);
                        self.queue_change(MembershipChange::Remove(member.name)).await;
                    }
                    break;
                }
                Err(status) => {
                    // Left to the faulty-host sweeper so a flapping host keeps its slot
                    log::warn!("Host stream {} failed: {}", stream_id, status);
                    break;
                }
            };

            if !self.has_leadership() {
                let _ = tx
                    .send(Err(Status::failed_precondition(
                        "placement service is not the leader",
                    )))
                    .await;
                break;
            }

            if !self.is_stream_registered(stream_id) {
                self.register_stream(
                    stream_id,
                    StreamConn {
                        host_name: host.name.clone(),
                        tx: tx.clone(),
                        needs_table: true,
                        cancel: cancel.clone(),
                    },
                );
            }
            self.last_heartbeat.insert(host.name.clone(), Instant::now());

            if host.entities.is_empty() {
                continue;
            }

            let mut member = Member::new(host.name, host.id, host.entities);
            member.updated_at = now_unix_nanos();

            if self.needs_upsert(&member, reported.as_ref()) {
                self.queue_change(MembershipChange::Upsert(member.clone())).await;
            }
            reported = Some(member);
        }

        self.remove_stream(stream_id);
        log::debug!("Host stream {} closed", stream_id);
    }

    /// Propose on the first heartbeat of a stream and whenever the
    /// replicated member differs from what the host reports
    fn needs_upsert(&self, member: &Member, reported: Option<&Member>) -> bool {
        if reported.is_none() {
            return true;
        }
        match self.fsm().member(&member.name) {
            Some(current) => !current.same_placement(member),
            None => true,
        }
    }

    pub(crate) async fn queue_change(&self, change: MembershipChange) {
        if self.membership_tx.send(change).await.is_err() {
            log::warn!("Membership channel closed; dropping change");
        }
    }
}
