//! `reqwest`-backed `ProxyClient`: the production transport.
//!
//! Every RPC is a `POST {proxy_endpoint}/rpc/{name}` with a JSON body and a
//! JSON response of the shape `{"ok": true, ...}` / `{"ok": false, "error":
//! "..."}`. There is no gRPC stack in this tree, so the wire format is kept
//! deliberately simple: one path per RPC, one body, one coarse result.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use crate::domain::ports::{
    DecodePlan, DeleteBlockRequest, EncodePlan, HelpRecalcPlan, ProxyClient, RecalcPlan,
    RecalcStep, RelocPlan,
};
use crate::error::{Error, Result};

#[derive(serde::Deserialize)]
struct Envelope<T> {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, bound(deserialize = "T: DeserializeOwned"))]
    data: Option<T>,
}

/// A durable `reqwest::Client`-backed stub for one proxy.
pub struct ProxyHttpClient {
    endpoint: String,
    client: reqwest::Client,
}

impl ProxyHttpClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, rpc: &str) -> String {
        format!("http://{}/rpc/{}", self.endpoint, rpc)
    }

    async fn call<B: Serialize + Send + Sync, T: DeserializeOwned>(
        &self,
        rpc: &'static str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .client
            .post(self.url(rpc))
            .json(body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::ProxyRpcFailed {
                rpc,
                cluster_id: u32::MAX,
                reason: e.to_string(),
            })?;
        let envelope: Envelope<T> = resp.json().await?;
        if !envelope.ok {
            return Err(Error::ProxyRpcFailed {
                rpc,
                cluster_id: u32::MAX,
                reason: envelope.error.unwrap_or_else(|| "unknown error".into()),
            });
        }
        envelope.data.ok_or(Error::ProxyRpcFailed {
            rpc,
            cluster_id: u32::MAX,
            reason: "missing response payload".into(),
        })
    }

    async fn call_unit<B: Serialize + Send + Sync>(&self, rpc: &'static str, body: &B) -> Result<()> {
        let resp = self.client.post(self.url(rpc)).json(body).send().await?;
        let envelope: Envelope<serde_json::Value> = resp.json().await?;
        if !envelope.ok {
            return Err(Error::ProxyRpcFailed {
                rpc,
                cluster_id: u32::MAX,
                reason: envelope.error.unwrap_or_else(|| "unknown error".into()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyClient for ProxyHttpClient {
    #[instrument(skip(self))]
    async fn checkalive(&self, name: &str) -> Result<String> {
        #[derive(Serialize)]
        struct Req<'a> {
            name: &'a str,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            name: String,
        }
        let resp: Resp = self.call("checkalive", &Req { name }).await?;
        Ok(resp.name)
    }

    #[instrument(skip(self, plan))]
    async fn encode_and_set(&self, plan: EncodePlan) -> Result<()> {
        self.call_unit("encodeAndSet", &plan).await
    }

    #[instrument(skip(self, plan))]
    async fn decode_and_get(&self, plan: DecodePlan) -> Result<()> {
        self.call_unit("decodeAndGet", &plan).await
    }

    #[instrument(skip(self, req))]
    async fn delete_block(&self, req: DeleteBlockRequest) -> Result<()> {
        self.call_unit("deleteBlock", &req).await
    }

    #[instrument(skip(self, plan))]
    async fn main_recalculate(&self, plan: RecalcPlan) -> Result<()> {
        self.call_unit("mainRecalculate", &plan).await
    }

    #[instrument(skip(self, plan))]
    async fn help_recalculate(&self, plan: HelpRecalcPlan) -> Result<()> {
        self.call_unit("helpRecalculate", &plan).await
    }

    #[instrument(skip(self, plan))]
    async fn block_reloc(&self, plan: RelocPlan) -> Result<()> {
        self.call_unit("blockReloc", &plan).await
    }

    #[instrument(skip(self))]
    async fn check_step(&self, step: RecalcStep) -> Result<bool> {
        #[derive(Serialize)]
        struct Req {
            step: RecalcStep,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            done: bool,
        }
        let resp: Resp = self.call("checkStep", &Req { step }).await?;
        Ok(resp.done)
    }
}
