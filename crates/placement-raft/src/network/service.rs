//! Raft gRPC Service
//!
//! Carries vote / append_entries / install_snapshot between placement
//! nodes. Payloads are bincode; the response payload is the bincode of the
//! full `Result` returned by the local openraft instance so remote errors
//! survive the hop.

use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use openraft::Raft;
use tonic::{Request, Response, Status};

use crate::state_machine::{decode, encode};
use crate::storage::PlacementTypeConfig;

pub const RPC_VOTE: &str = "vote";
pub const RPC_APPEND_ENTRIES: &str = "append_entries";
pub const RPC_INSTALL_SNAPSHOT: &str = "install_snapshot";

/// Raft RPC request message
#[derive(Clone, PartialEq, prost::Message)]
pub struct RaftRpcRequest {
    /// RPC type: "vote", "append_entries", "install_snapshot"
    #[prost(string, tag = "1")]
    pub rpc_type: String,

    /// Serialized RPC payload
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// Raft RPC response message
#[derive(Clone, PartialEq, prost::Message)]
pub struct RaftRpcResponse {
    /// Serialized `Result<Response, RaftError>`
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,

    /// Transport-level error (request could not be decoded or routed)
    #[prost(string, tag = "2")]
    pub error: String,
}

/// Generated gRPC client module
pub mod raft_client {
    use super::*;
    use tonic::codegen::*;

    /// Raft RPC client
    #[derive(Debug, Clone)]
    pub struct RaftClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl RaftClient<tonic::transport::Channel> {
        pub fn new(channel: tonic::transport::Channel) -> Self {
            let inner = tonic::client::Grpc::new(channel);
            Self { inner }
        }
    }

    impl<T> RaftClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError> + std::fmt::Debug,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        /// Send a Raft RPC
        pub async fn raft_rpc(
            &mut self,
            request: impl tonic::IntoRequest<RaftRpcRequest>,
        ) -> std::result::Result<tonic::Response<RaftRpcResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(tonic::Code::Unavailable, format!("Service not ready: {:?}", e))
            })?;

            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/placement.raft.Raft/RaftRpc");
            let mut req = request.into_request();
            req.extensions_mut()
                .insert(GrpcMethod::new("placement.raft.Raft", "RaftRpc"));
            self.inner.unary(req, path, codec).await
        }
    }
}

/// Generated gRPC server module
pub mod raft_server {
    use super::*;
    use tonic::codegen::*;

    /// Raft service trait
    #[async_trait::async_trait]
    pub trait Raft: std::marker::Send + std::marker::Sync + 'static {
        async fn raft_rpc(
            &self,
            request: tonic::Request<RaftRpcRequest>,
        ) -> std::result::Result<tonic::Response<RaftRpcResponse>, tonic::Status>;
    }

    /// Raft service server
    #[derive(Debug)]
    pub struct RaftServer<T: Raft> {
        inner: Arc<T>,
    }

    impl<T: Raft> RaftServer<T> {
        pub fn new(inner: T) -> Self {
            Self {
                inner: Arc::new(inner),
            }
        }

        pub fn from_arc(inner: Arc<T>) -> Self {
            Self { inner }
        }
    }

    impl<T: Raft> Clone for RaftServer<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }

    impl<T: Raft> tonic::server::NamedService for RaftServer<T> {
        const NAME: &'static str = "placement.raft.Raft";
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for RaftServer<T>
    where
        T: Raft,
        B: Body + std::marker::Send + 'static,
        B::Error: Into<StdError> + std::marker::Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            let inner = self.inner.clone();

            match req.uri().path() {
                "/placement.raft.Raft/RaftRpc" => {
                    let fut = async move {
                        let mut grpc =
                            tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                        let method = RaftRpcSvc(inner);
                        Ok(grpc.unary(method, req).await)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    let mut response = http::Response::new(empty_body());
                    let headers = response.headers_mut();
                    headers.insert(
                        tonic::Status::GRPC_STATUS,
                        (tonic::Code::Unimplemented as i32).into(),
                    );
                    headers.insert(
                        http::header::CONTENT_TYPE,
                        tonic::metadata::GRPC_CONTENT_TYPE,
                    );
                    Ok(response)
                }),
            }
        }
    }

    struct RaftRpcSvc<T: Raft>(Arc<T>);

    impl<T: Raft> tonic::server::UnaryService<RaftRpcRequest> for RaftRpcSvc<T> {
        type Response = RaftRpcResponse;
        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

        fn call(&mut self, request: tonic::Request<RaftRpcRequest>) -> Self::Future {
            let inner = self.0.clone();
            Box::pin(async move { inner.raft_rpc(request).await })
        }
    }
}

/// Raft gRPC service implementation backed by the local openraft instance
pub struct RaftService {
    raft: Raft<PlacementTypeConfig>,
}

impl RaftService {
    pub fn new(raft: Raft<PlacementTypeConfig>) -> Self {
        Self { raft }
    }

    async fn dispatch(&self, rpc_type: &str, payload: &[u8]) -> crate::Result<Vec<u8>> {
        match rpc_type {
            RPC_VOTE => {
                let req: VoteRequest<u64> = decode(payload)?;
                encode(&self.raft.vote(req).await)
            }
            RPC_APPEND_ENTRIES => {
                let req: AppendEntriesRequest<PlacementTypeConfig> = decode(payload)?;
                encode(&self.raft.append_entries(req).await)
            }
            RPC_INSTALL_SNAPSHOT => {
                let req: InstallSnapshotRequest<PlacementTypeConfig> = decode(payload)?;
                encode(&self.raft.install_snapshot(req).await)
            }
            other => Err(crate::RaftError::Network(format!("Unknown RPC type: {}", other))),
        }
    }
}

#[async_trait::async_trait]
impl raft_server::Raft for RaftService {
    async fn raft_rpc(
        &self,
        request: Request<RaftRpcRequest>,
    ) -> Result<Response<RaftRpcResponse>, Status> {
        let req = request.into_inner();

        match self.dispatch(&req.rpc_type, &req.payload).await {
            Ok(payload) => Ok(Response::new(RaftRpcResponse {
                payload,
                error: String::new(),
            })),
            Err(e) => {
                log::warn!("Raft RPC {} failed: {}", req.rpc_type, e);
                Ok(Response::new(RaftRpcResponse {
                    payload: Vec::new(),
                    error: e.to_string(),
                }))
            }
        }
    }
}
