// Thin reqwest wrapper that speaks the {"success", "data"} envelope

use anyhow::{anyhow, bail};
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::cli::config::CliConfig;

/// For requests without query parameters
pub const NO_QUERY: &[(&str, &str)] = &[];

pub struct ApiClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &CliConfig, server: Option<&str>) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(120)).build()?;
        Ok(Self {
            http,
            base_url: config.server(server),
            token: config.token.clone(),
        })
    }

    /// Same client, but fails early when no session is saved
    pub fn authenticated(config: &CliConfig, server: Option<&str>) -> anyhow::Result<Self> {
        if config.token.is_none() {
            bail!("Not logged in. Run `relayctl auth login <email>` first");
        }
        Self::new(config, server)
    }

    pub async fn get<Q: Serialize + ?Sized>(&self, path: &str, query: &Q) -> anyhow::Result<Value> {
        self.send(self.request(Method::GET, path).query(query)).await
    }

    pub async fn post<Q: Serialize + ?Sized, B: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &Q,
        body: &B,
    ) -> anyhow::Result<Value> {
        self.send(self.request(Method::POST, path).query(query).json(body)).await
    }

    pub async fn delete(&self, path: &str) -> anyhow::Result<Value> {
        self.send(self.request(Method::DELETE, path)).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> anyhow::Result<Value> {
        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if text.is_empty() {
            if status.is_success() {
                return Ok(Value::Null);
            }
            bail!("Server returned {}", status);
        }

        let body: Value = serde_json::from_str(&text).map_err(|_| anyhow!("Server returned {}: {}", status, text))?;
        unwrap_envelope(status.as_u16(), body)
    }
}

/// Pull `data` out of a success envelope, or turn a failure into an error
pub fn unwrap_envelope(status: u16, mut body: Value) -> anyhow::Result<Value> {
    if body["success"].as_bool() == Some(true) {
        return Ok(body["data"].take());
    }

    let message = body["error"].as_str().unwrap_or("request failed");
    match body["code"].as_str() {
        Some(code) => bail!("{} ({}, HTTP {})", message, code, status),
        None => bail!("{} (HTTP {})", message, status),
    }
}
