//! Forwards one inbound request to the cluster node that owns the target
//! plugin. Node lookup lives in `plugind-cluster`; this crate
//! only does the HTTP half: header rewriting, the redirect-depth loop guard,
//! and the 240 s deadline.

use std::time::Duration;

use plugind_cluster::NodeRecord;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;

/// Case-insensitive; reqwest lower-cases header names on the wire so we
/// compare against the lower-case form directly.
pub const REDIRECT_DEPTH_HEADER: &str = "plugin-redirect-depth";
pub const DEADLINE: Duration = Duration::from_secs(240);
const MAX_REDIRECT_DEPTH: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum RedirectError {
    #[error("redirect depth {0} exceeds the maximum of {MAX_REDIRECT_DEPTH}")]
    DepthExceeded(u32),
    #[error("forwarding to {url}: {source}")]
    Forward { url: String, #[source] source: reqwest::Error },
}

pub struct ForwardedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    let to_remove: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            let n = name.as_str();
            n.starts_with("x-forwarded-") || n == "x-real-ip" || n.starts_with("x-original-")
        })
        .cloned()
        .collect();
    for name in to_remove {
        headers.remove(name);
    }
}

fn incoming_depth(headers: &HeaderMap) -> u32 {
    headers
        .get(REDIRECT_DEPTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Clones `headers`, rewrites them for the hop to `node`, and issues
/// `method path` against it with a 240 s deadline. Returns `DepthExceeded`
/// without making any request when the incremented depth would exceed 1,
/// matching the "refuses to forward" loop-protection rule.
pub async fn forward(
    client: &reqwest::Client,
    node: &NodeRecord,
    method: Method,
    path: &str,
    mut headers: HeaderMap,
    body: Vec<u8>,
) -> Result<ForwardedResponse, RedirectError> {
    let next_depth = incoming_depth(&headers) + 1;
    if next_depth > MAX_REDIRECT_DEPTH {
        return Err(RedirectError::DepthExceeded(next_depth));
    }

    strip_hop_headers(&mut headers);
    headers.insert(
        HeaderName::from_static(REDIRECT_DEPTH_HEADER),
        HeaderValue::from_str(&next_depth.to_string()).expect("digit string is a valid header value"),
    );

    let url = format!("http://{}:{}{}", node.host, node.port, path);
    let response = client
        .request(method, &url)
        .headers(headers)
        .body(body)
        .timeout(DEADLINE)
        .send()
        .await
        .map_err(|source| RedirectError::Forward { url: url.clone(), source })?;

    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map_err(|source| RedirectError::Forward { url, source })?
        .to_vec();

    Ok(ForwardedResponse { status, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use reqwest::header::HeaderValue;
    use std::net::SocketAddr;

    async fn spawn_echo_server() -> SocketAddr {
        let app = Router::new().route("/hit", get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn forwards_request_and_strips_forwarded_headers() {
        let addr = spawn_echo_server().await;
        let node = NodeRecord {
            id: uuid::Uuid::new_v4(),
            host: "127.0.0.1".into(),
            port: addr.port(),
            now: chrono::Utc::now(),
            is_master: false,
            vote_token: String::new(),
            plugins: vec![],
        };

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));

        let client = reqwest::Client::new();
        let response = forward(&client, &node, Method::GET, "/hit", headers, Vec::new()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"ok");
    }

    #[tokio::test]
    async fn refuses_to_forward_past_depth_one() {
        let addr = spawn_echo_server().await;
        let node = NodeRecord {
            id: uuid::Uuid::new_v4(),
            host: "127.0.0.1".into(),
            port: addr.port(),
            now: chrono::Utc::now(),
            is_master: false,
            vote_token: String::new(),
            plugins: vec![],
        };

        let mut headers = HeaderMap::new();
        headers.insert(REDIRECT_DEPTH_HEADER, HeaderValue::from_static("1"));

        let client = reqwest::Client::new();
        let err = forward(&client, &node, Method::GET, "/hit", headers, Vec::new()).await.unwrap_err();

        assert!(matches!(err, RedirectError::DepthExceeded(2)));
    }
}
