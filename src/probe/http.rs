//! HTTP check.

use super::{ProbeError, Prober};
use crate::config::{GroupParams, HttpMethod};
use crate::model::{CheckResult, ErrType};

use chrono::Utc;
use rand::seq::SliceRandom;
use reqwest::header::{CONTENT_LENGTH, USER_AGENT};
use std::sync::Arc;
use std::time::Instant;

const DEFAULT_USER_AGENT: &str = concat!("streamwatch/", env!("CARGO_PKG_VERSION"));

/// Build the client shared by all workers of a pool.
pub(crate) fn build_client(params: &GroupParams) -> Result<reqwest::Client, ProbeError> {
    reqwest::Client::builder()
        .connect_timeout(params.connect_timeout)
        .read_timeout(params.rw_timeout)
        .timeout(params.connect_timeout + params.rw_timeout)
        .build()
        .map_err(ProbeError::Client)
}

fn pick_user_agent(user_agents: &Arc<Vec<String>>) -> String {
    user_agents
        .choose(&mut rand::thread_rng())
        .cloned()
        .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
}

impl Prober {
    /// Request `uri` with the group's method and classify the response.
    ///
    /// The body is captured only when `read_body` is set and the group uses GET.
    pub async fn exec_http(&self, uri: &str, read_body: bool) -> CheckResult {
        self.fetch(uri, self.params.http_method, read_body).await
    }

    /// Request `uri` with an explicit method. HEAD never reads the body.
    pub(super) async fn fetch(&self, uri: &str, method: HttpMethod, read_body: bool) -> CheckResult {
        let mut result = CheckResult::new(uri, Utc::now());

        let url = match reqwest::Url::parse(uri) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => {
                result.err_type = ErrType::BadUri;
                return result;
            }
        };

        let (method, read_body) = match method {
            HttpMethod::Get => (reqwest::Method::GET, read_body),
            HttpMethod::Head => (reqwest::Method::HEAD, false),
        };

        let start = Instant::now();
        let request = self
            .client
            .request(method, url)
            .header(USER_AGENT, pick_user_agent(&self.user_agents));

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                result.elapsed = start.elapsed();
                result.err_type = if e.is_builder() {
                    ErrType::BadUri
                } else if result.elapsed >= self.params.connect_timeout {
                    ErrType::CTimeout
                } else {
                    ErrType::Refused
                };
                tracing::debug!("Probe: request to {} failed: {}", uri, e);
                return result;
            }
        };

        let status = response.status();
        result.http_code = status.as_u16();
        result.http_status = match status.canonical_reason() {
            Some(reason) => format!("{} {}", status.as_u16(), reason),
            None => status.as_u16().to_string(),
        };
        result.headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
            .collect();
        result.content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(-1);

        if !(200..400).contains(&result.http_code) {
            result.elapsed = start.elapsed();
            result.err_type = ErrType::BadStatus;
            return result;
        }

        if read_body {
            match response.bytes().await {
                Ok(body) => {
                    result.real_content_length = body.len() as i64;
                    result.body = body.to_vec();
                    if result.content_length >= 0 && result.content_length != result.real_content_length {
                        result.err_type = ErrType::BadLength;
                    }
                }
                Err(e) => {
                    result.err_type = if e.is_timeout() {
                        ErrType::RTimeout
                    } else {
                        ErrType::BodyRead
                    };
                    tracing::debug!("Probe: body read from {} failed: {}", uri, e);
                }
            }
        }

        result.elapsed = start.elapsed();
        result
    }
}
