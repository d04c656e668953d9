//! Session-negotiation rewrite pipeline
//!
//! A single pass over one intercepted request: either it passes through
//! untouched, or a complete replacement header set and body are produced.
//! Nothing is kept between requests.

use crate::config::TargetConfig;
use crate::error::{RelayError, Result};
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING, USER_AGENT};
use hyper::{HeaderMap, Method};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

/// Names the streaming implementation that opened the session
pub const STREAMER_HEADER: &str = "nv-client-streamer";
pub const WEBRTC_STREAMER: &str = "WEBRTC";

/// User agent of the native desktop client
pub const NATIVE_USER_AGENT: &str =
    "GFN-PC/30.0 (Windows 10.0.19041) BifrostClientSDK/4.77 (36006357)";

const NATIVE_CLIENT_HEADERS: [(&str, &str); 4] = [
    ("nv-client-type", "NATIVE"),
    ("nv-device-type", "DESKTOP"),
    ("nv-device-os", "WINDOWS"),
    ("nv-client-streamer", "NVIDIA-CLASSIC"),
];

const SESSION_DATA_KEY: &str = "sessionRequestData";
const MONITOR_SETTINGS_KEY: &str = "clientRequestMonitorSettings";

/// One request selected for inspection
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Replacement header set and body for a rewritten request
#[derive(Debug, Clone)]
pub struct RewriteDescriptor {
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub enum RewriteOutcome {
    PassThrough,
    Rewrite(RewriteDescriptor),
}

/// Rewrites session-negotiation calls to request the configured display mode
#[derive(Debug, Clone)]
pub struct SessionRewriter {
    target: TargetConfig,
}

impl SessionRewriter {
    pub fn new(target: TargetConfig) -> Self {
        Self { target }
    }

    /// Whether a request to `url` with `method` would be rewritten.
    pub fn is_eligible(&self, url: &Url, method: &Method) -> bool {
        self.target.is_session_url(url) && is_session_change(method)
    }

    pub fn rewrite(&self, request: &InterceptedRequest) -> Result<RewriteOutcome> {
        if !self.target.is_session_url(&request.url) {
            return Ok(RewriteOutcome::PassThrough);
        }

        let streamer = request
            .headers
            .get(STREAMER_HEADER)
            .and_then(|v| v.to_str().ok());

        if let Some(streamer) = streamer {
            debug!("Stream type detected: {}", streamer);
        }

        if !is_session_change(&request.method) {
            return Ok(RewriteOutcome::PassThrough);
        }

        info!("Session change detected: {}", request.method);

        let mut headers = request.headers.clone();

        if request.method == Method::POST && streamer == Some(WEBRTC_STREAMER) {
            info!("WebRTC session create detected, presenting as native client");
            for (name, value) in NATIVE_CLIENT_HEADERS {
                headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
            }
            headers.insert(USER_AGENT, HeaderValue::from_static(NATIVE_USER_AGENT));
        }

        let body = match &request.body {
            Some(body) => {
                let rewritten = self.rewrite_body(body)?;
                headers.remove(TRANSFER_ENCODING);
                headers.insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
                Some(rewritten)
            }
            None => None,
        };

        Ok(RewriteOutcome::Rewrite(RewriteDescriptor { headers, body }))
    }

    /// Replace the monitor list of a session payload with the configured mode.
    pub fn rewrite_body(&self, body: &[u8]) -> Result<Bytes> {
        let mut payload: Value = serde_json::from_slice(body)
            .map_err(|e| RelayError::RequestRewrite(format!("body is not JSON: {}", e)))?;

        let session = payload
            .get_mut(SESSION_DATA_KEY)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                RelayError::RequestRewrite(format!("body has no `{}` object", SESSION_DATA_KEY))
            })?;

        let monitor = serde_json::to_value(self.target.monitor)
            .map_err(|e| RelayError::RequestRewrite(e.to_string()))?;
        session.insert(MONITOR_SETTINGS_KEY.to_string(), Value::Array(vec![monitor]));

        debug!(
            "Requesting {}x{}@{}",
            self.target.monitor.width, self.target.monitor.height, self.target.monitor.fps
        );

        serde_json::to_vec(&payload)
            .map(Bytes::from)
            .map_err(|e| RelayError::RequestRewrite(e.to_string()))
    }
}

fn is_session_change(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT
}
