//! Host-facing wire protocol
//!
//! Messages are declared by hand with `prost` derives and the gRPC
//! client/server glue is written against `tonic::codegen` directly, so the
//! crate needs no build script or `protoc`.
//!
//! ```text
//! service Placement {
//!   rpc ReportAppStatus(stream Host) returns (stream PlacementOrder);
//! }
//! ```

use std::collections::HashMap;

/// Fully-qualified gRPC service name
pub const SERVICE_NAME: &str = "placement.v1.Placement";

/// Path of the `ReportAppStatus` bidirectional stream
pub const REPORT_APP_STATUS_PATH: &str = "/placement.v1.Placement/ReportAppStatus";

/// Heartbeat sent by a runtime host
#[derive(Clone, PartialEq, prost::Message)]
pub struct Host {
    /// Stable `host:port` identity
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(int64, tag = "2")]
    pub load: i64,

    /// Actor types served by this host
    #[prost(string, repeated, tag = "3")]
    pub entities: Vec<String>,

    /// Application id
    #[prost(string, tag = "4")]
    pub id: String,

    #[prost(uint32, tag = "5")]
    pub port: u32,
}

/// Control message sent by the leader
#[derive(Clone, PartialEq, prost::Message)]
pub struct PlacementOrder {
    /// One of `lock`, `update`, `unlock`
    #[prost(string, tag = "1")]
    pub operation: String,

    /// Only present on `update`
    #[prost(message, optional, tag = "2")]
    pub tables: Option<PlacementTables>,
}

/// All rings, stamped with the table generation
#[derive(Clone, PartialEq, prost::Message)]
pub struct PlacementTables {
    #[prost(map = "string, message", tag = "1")]
    pub entries: HashMap<String, PlacementTable>,

    /// Decimal table generation
    #[prost(string, tag = "2")]
    pub version: String,
}

/// One consistent hash ring in wire form
#[derive(Clone, PartialEq, prost::Message)]
pub struct PlacementTable {
    #[prost(map = "uint64, string", tag = "1")]
    pub hosts: HashMap<u64, String>,

    #[prost(uint64, repeated, tag = "2")]
    pub sorted_set: Vec<u64>,

    #[prost(map = "string, message", tag = "3")]
    pub load_map: HashMap<String, Host>,

    #[prost(int64, tag = "4")]
    pub total_load: i64,
}

/// Placement order operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Lock,
    Update,
    Unlock,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Lock => "lock",
            Operation::Update => "update",
            Operation::Unlock => "unlock",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lock" => Some(Operation::Lock),
            "update" => Some(Operation::Update),
            "unlock" => Some(Operation::Unlock),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PlacementOrder {
    pub fn lock() -> Self {
        Self {
            operation: Operation::Lock.as_str().to_string(),
            tables: None,
        }
    }

    pub fn update(tables: PlacementTables) -> Self {
        Self {
            operation: Operation::Update.as_str().to_string(),
            tables: Some(tables),
        }
    }

    pub fn unlock() -> Self {
        Self {
            operation: Operation::Unlock.as_str().to_string(),
            tables: None,
        }
    }

    pub fn op(&self) -> Option<Operation> {
        Operation::parse(&self.operation)
    }
}

/// gRPC client for the `Placement` service
pub mod placement_client {
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct PlacementClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl PlacementClient<tonic::transport::Channel> {
        pub fn new(channel: tonic::transport::Channel) -> Self {
            Self {
                inner: tonic::client::Grpc::new(channel),
            }
        }
    }

    impl<T> PlacementClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn with_inner(inner: T) -> Self {
            Self {
                inner: tonic::client::Grpc::new(inner),
            }
        }

        /// Open the heartbeat / placement-order stream
        pub async fn report_app_status(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::Host>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::PlacementOrder>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unavailable(format!("Service not ready: {}", e.into()))
            })?;

            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(super::REPORT_APP_STATUS_PATH);
            let mut req = request.into_streaming_request();
            req.extensions_mut()
                .insert(GrpcMethod::new(super::SERVICE_NAME, "ReportAppStatus"));
            self.inner.streaming(req, path, codec).await
        }
    }
}

/// gRPC server for the `Placement` service
pub mod placement_server {
    use tonic::codegen::*;

    #[async_trait]
    pub trait Placement: std::marker::Send + std::marker::Sync + 'static {
        type ReportAppStatusStream: tonic::codegen::tokio_stream::Stream<
                Item = std::result::Result<super::PlacementOrder, tonic::Status>,
            > + std::marker::Send
            + 'static;

        async fn report_app_status(
            &self,
            request: tonic::Request<tonic::Streaming<super::Host>>,
        ) -> std::result::Result<tonic::Response<Self::ReportAppStatusStream>, tonic::Status>;
    }

    #[derive(Debug)]
    pub struct PlacementServer<T: Placement> {
        inner: Arc<T>,
    }

    impl<T: Placement> PlacementServer<T> {
        pub fn new(inner: T) -> Self {
            Self::from_arc(Arc::new(inner))
        }

        pub fn from_arc(inner: Arc<T>) -> Self {
            Self { inner }
        }
    }

    impl<T: Placement> Clone for PlacementServer<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }

    impl<T: Placement> tonic::server::NamedService for PlacementServer<T> {
        const NAME: &'static str = super::SERVICE_NAME;
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for PlacementServer<T>
    where
        T: Placement,
        B: Body + std::marker::Send + 'static,
        B::Error: Into<StdError> + std::marker::Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                super::REPORT_APP_STATUS_PATH => {
                    let inner = self.inner.clone();
                    let fut = async move {
                        let method = ReportAppStatusSvc(inner);
                        let mut grpc =
                            tonic::server::Grpc::new(tonic::codec::ProstCodec::default());
                        Ok(grpc.streaming(method, req).await)
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

    struct ReportAppStatusSvc<T: Placement>(Arc<T>);

    impl<T: Placement> tonic::server::StreamingService<super::Host> for ReportAppStatusSvc<T> {
        type Response = super::PlacementOrder;
        type ResponseStream = T::ReportAppStatusStream;
        type Future = BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;

        fn call(&mut self, request: tonic::Request<tonic::Streaming<super::Host>>) -> Self::Future {
            let inner = self.0.clone();
            Box::pin(async move { inner.report_app_status(request).await })
        }
    }
}
