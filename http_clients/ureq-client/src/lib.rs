use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sigcore::net::{HttpClient, HttpRequest, HttpResponse};
use std::collections::HashMap;
use ureq::RequestBuilder;
use ureq::typestate::{WithBody, WithoutBody};

/// Room server client built on the blocking `ureq` agent. Each request runs
/// on tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct UreqHttpClient {
    agent: ureq::Agent,
}

impl UreqHttpClient {
    pub fn new() -> Self {
        // Non-2xx statuses come back as responses; the engines word the error.
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build();
        Self {
            agent: config.into(),
        }
    }
}

impl Default for UreqHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn without_body(
    mut builder: RequestBuilder<WithoutBody>,
    headers: &HashMap<String, String>,
) -> RequestBuilder<WithoutBody> {
    for (key, value) in headers {
        builder = builder.header(key, value);
    }
    builder
}

fn with_body(
    mut builder: RequestBuilder<WithBody>,
    headers: &HashMap<String, String>,
) -> RequestBuilder<WithBody> {
    for (key, value) in headers {
        builder = builder.header(key, value);
    }
    builder
}

fn execute_blocking(agent: &ureq::Agent, request: HttpRequest) -> Result<HttpResponse> {
    let HttpRequest {
        url,
        method,
        headers,
        body,
    } = request;

    let response = match method.as_str() {
        "GET" => without_body(agent.get(&url), &headers).call()?,
        "DELETE" => without_body(agent.delete(&url), &headers).call()?,
        "POST" => {
            let body = body.unwrap_or_default();
            with_body(agent.post(&url), &headers).send(&body[..])?
        }
        other => return Err(anyhow!("Unsupported HTTP method: {other}")),
    };

    let status_code = response.status().as_u16();
    let body = response.into_body().read_to_vec()?;
    Ok(HttpResponse { status_code, body })
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || execute_blocking(&agent, request)).await?
    }
}
