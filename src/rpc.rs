//! Client- and proxy-facing RPC server (spec.md §6): one `hyper` HTTP/1
//! server, one path per RPC, JSON bodies in the same envelope shape
//! [`crate::adapters::ProxyHttpClient`] expects from a proxy: `{"ok":
//! true, "data": ...}` / `{"ok": false, "error": "..."}`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, instrument};

use crate::coordinator::Coordinator;
use crate::domain::model::{ClusterId, EcSchema, Operation, Stripe, StripeId};
use crate::error::{Error, Result};
use crate::metrics::CoordinatorMetrics;

#[derive(Serialize)]
struct Envelope<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    fn ok(data: T) -> Self {
        Envelope {
            ok: true,
            error: None,
            data: Some(data),
        }
    }
}

fn envelope_err(e: &Error) -> Envelope<()> {
    Envelope {
        ok: false,
        error: Some(e.to_string()),
        data: None,
    }
}

fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::NoSuchKey(_) | Error::NoSuchStripe(_) | Error::UnknownCluster(_) => StatusCode::NOT_FOUND,
        Error::SchemaNotSet | Error::SchemaRejected(_) | Error::MergePreconditionFailed(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{\"ok\":false}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .unwrap()
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Incoming>) -> std::result::Result<T, String> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| e.to_string())?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

// =============================================================================
// Request/response payloads
// =============================================================================

#[derive(Deserialize)]
struct UploadReq {
    key: String,
    size: u64,
}

#[derive(Serialize)]
struct UploadResp {
    stripe_id: StripeId,
    serving_cluster: ClusterId,
    serving_proxy_endpoint: String,
}

#[derive(Deserialize)]
struct GetReq {
    key: String,
    client_endpoint: String,
}

#[derive(Serialize)]
struct GetResp {
    stripe: Stripe,
    serving_proxy_endpoint: String,
    object_size: u64,
}

#[derive(Deserialize)]
struct KeyReq {
    key: String,
}

#[derive(Serialize)]
struct DelByKeyResp {
    stripe_id: StripeId,
}

#[derive(Deserialize)]
struct StripeReq {
    stripe_id: StripeId,
}

#[derive(Serialize)]
struct ListStripesResp {
    stripes: Vec<Stripe>,
}

#[derive(Deserialize)]
struct CheckCommitAbortReq {
    key: String,
    operation: Operation,
    stripe_id: StripeId,
}

#[derive(Serialize)]
struct CheckCommitAbortResp {
    committed: bool,
}

#[derive(Deserialize)]
struct RequestMergeReq {
    step: u32,
}

#[derive(Serialize)]
struct RequestMergeResp {
    merged: bool,
    lc: f64,
    gc: f64,
    dc: f64,
}

#[derive(Deserialize)]
struct CheckaliveReq {
    name: String,
    #[serde(default)]
    cluster_id: Option<ClusterId>,
}

#[derive(Serialize)]
struct CheckaliveResp {
    name: String,
}

#[derive(Deserialize)]
struct ReportCommitAbortReq {
    key: String,
    operation: Operation,
    stripe_id: StripeId,
    committed: bool,
}

// =============================================================================
// Dispatch
// =============================================================================

#[instrument(skip(coordinator, metrics, req))]
async fn dispatch(
    coordinator: Arc<Coordinator>,
    metrics: Arc<CoordinatorMetrics>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if req.method() != Method::POST {
        return json_response(StatusCode::METHOD_NOT_ALLOWED, &envelope_err(&Error::Internal("POST only".into())));
    }
    let path = req.uri().path().to_string();
    metrics.record_rpc(&path);

    macro_rules! run {
        ($body:expr) => {
            match $body {
                Ok(resp) => resp,
                Err(e) => {
                    let status = status_for(&e);
                    let resp = json_response(status, &envelope_err(&e));
                    resp
                }
            }
        };
    }

    match path.as_str() {
        "/rpc/setParameter" => {
            let schema: EcSchema = match read_json(req).await {
                Ok(s) => s,
                Err(e) => return json_response(StatusCode::BAD_REQUEST, &envelope_err(&Error::Internal(e))),
            };
            run!(coordinator
                .set_parameter(schema)
                .await
                .map(|_| json_response(StatusCode::OK, &Envelope::ok(()))))
        }
        "/rpc/uploadOriginKeyValue" => {
            let body: UploadReq = match read_json(req).await {
                Ok(b) => b,
                Err(e) => return json_response(StatusCode::BAD_REQUEST, &envelope_err(&Error::Internal(e))),
            };
            run!(coordinator.upload_origin_key_value(&body.key, body.size).await.map(|p| {
                json_response(
                    StatusCode::OK,
                    &Envelope::ok(UploadResp {
                        stripe_id: p.stripe_id,
                        serving_cluster: p.serving_cluster,
                        serving_proxy_endpoint: p.serving_proxy_endpoint,
                    }),
                )
            }))
        }
        "/rpc/getValue" => {
            let body: GetReq = match read_json(req).await {
                Ok(b) => b,
                Err(e) => return json_response(StatusCode::BAD_REQUEST, &envelope_err(&Error::Internal(e))),
            };
            run!(coordinator.get_value(&body.key, &body.client_endpoint).await.map(|p| {
                json_response(
                    StatusCode::OK,
                    &Envelope::ok(GetResp {
                        stripe: p.stripe,
                        serving_proxy_endpoint: p.serving_proxy_endpoint,
                        object_size: p.object_size,
                    }),
                )
            }))
        }
        "/rpc/delByKey" => {
            let body: KeyReq = match read_json(req).await {
                Ok(b) => b,
                Err(e) => return json_response(StatusCode::BAD_REQUEST, &envelope_err(&Error::Internal(e))),
            };
            run!(coordinator
                .del_by_key(&body.key)
                .await
                .map(|stripe_id| json_response(StatusCode::OK, &Envelope::ok(DelByKeyResp { stripe_id }))))
        }
        "/rpc/delByStripe" => {
            let body: StripeReq = match read_json(req).await {
                Ok(b) => b,
                Err(e) => return json_response(StatusCode::BAD_REQUEST, &envelope_err(&Error::Internal(e))),
            };
            run!(coordinator
                .del_by_stripe(body.stripe_id)
                .await
                .map(|_| json_response(StatusCode::OK, &Envelope::ok(()))))
        }
        "/rpc/listStripes" => {
            let stripes = coordinator.list_stripes();
            json_response(StatusCode::OK, &Envelope::ok(ListStripesResp { stripes }))
        }
        "/rpc/checkCommitAbort" => {
            let body: CheckCommitAbortReq = match read_json(req).await {
                Ok(b) => b,
                Err(e) => return json_response(StatusCode::BAD_REQUEST, &envelope_err(&Error::Internal(e))),
            };
            metrics.inc_commit_abort_waiters();
            let committed = coordinator
                .check_commit_abort(&body.key, body.operation, body.stripe_id)
                .await;
            metrics.dec_commit_abort_waiters();
            json_response(StatusCode::OK, &Envelope::ok(CheckCommitAbortResp { committed }))
        }
        "/rpc/requestMerge" => {
            let body: RequestMergeReq = match read_json(req).await {
                Ok(b) => b,
                Err(e) => return json_response(StatusCode::BAD_REQUEST, &envelope_err(&Error::Internal(e))),
            };
            let outcome = coordinator.request_merge(body.step).await;
            metrics.record_merge_outcome(outcome.merged);
            json_response(
                StatusCode::OK,
                &Envelope::ok(RequestMergeResp {
                    merged: outcome.merged,
                    lc: outcome.local_recompute_secs,
                    gc: outcome.global_recompute_secs,
                    dc: outcome.relocation_secs,
                }),
            )
        }
        "/rpc/checkalive" => {
            let body: CheckaliveReq = match read_json(req).await {
                Ok(b) => b,
                Err(e) => return json_response(StatusCode::BAD_REQUEST, &envelope_err(&Error::Internal(e))),
            };
            match body.cluster_id {
                Some(cluster_id) => run!(coordinator
                    .checkalive(cluster_id)
                    .await
                    .map(|name| json_response(StatusCode::OK, &Envelope::ok(CheckaliveResp { name })))),
                None => json_response(StatusCode::OK, &Envelope::ok(CheckaliveResp { name: body.name })),
            }
        }
        "/rpc/reportCommitAbort" => {
            let body: ReportCommitAbortReq = match read_json(req).await {
                Ok(b) => b,
                Err(e) => return json_response(StatusCode::BAD_REQUEST, &envelope_err(&Error::Internal(e))),
            };
            coordinator
                .report_commit_abort(&body.key, body.operation, body.stripe_id, body.committed)
                .await;
            json_response(StatusCode::OK, &Envelope::ok(()))
        }
        _ => json_response(StatusCode::NOT_FOUND, &envelope_err(&Error::Internal(format!("no such RPC: {path}")))),
    }
}

/// Serve the client + proxy-callback RPC surface on `addr` until the
/// process exits. Mirrors the teacher's `run_health_server`/
/// `run_metrics_server` raw-`hyper` shape, generalized to dispatch by
/// path instead of handling one fixed route.
pub async fn run_rpc_server(addr: &str, coordinator: Arc<Coordinator>, metrics: Arc<CoordinatorMetrics>) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("invalid RPC server address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "RPC server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let coordinator = coordinator.clone();
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let coordinator = coordinator.clone();
                let metrics = metrics.clone();
                async move { Ok::<_, Infallible>(dispatch(coordinator, metrics, req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "RPC server connection error");
            }
        });
    }
}
