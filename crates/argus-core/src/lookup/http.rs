//! Shared HTTP plumbing for lookups, webhooks and notifiers.

use crate::error::{ArgusError, Result};
use crate::types::{BasicAuth, Header};
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;

const USER_AGENT: &str = concat!("argus/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded retries inside a single query. Only transport errors and 5xx
/// responses are retried; anything else is returned to the caller as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            pause: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// No pause between attempts. Used by tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            pause: Duration::ZERO,
        }
    }
}

pub fn build_client(allow_invalid_certs: bool) -> Result<Client> {
    Ok(Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .danger_accept_invalid_certs(allow_invalid_certs)
        .build()?)
}

/// Attach custom headers and basic auth to a request.
pub fn decorate(
    mut req: RequestBuilder,
    headers: &[Header],
    basic_auth: Option<&BasicAuth>,
) -> RequestBuilder {
    for h in headers {
        req = req.header(h.key.as_str(), h.value.as_str());
    }
    if let Some(auth) = basic_auth {
        req = req.basic_auth(&auth.username, Some(&auth.password));
    }
    req
}

/// Send the request built by `build`, retrying per `policy`.
///
/// The last 5xx response is returned rather than turned into an error so
/// callers can report its body.
pub async fn send_with_retries<F>(policy: RetryPolicy, build: F) -> Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match build().send().await {
            Ok(resp) if resp.status().is_server_error() && attempt < attempts => {
                tracing::debug!(status = %resp.status(), attempt, "server error, retrying");
            }
            Ok(resp) => return Ok(resp),
            Err(e) if attempt < attempts => {
                tracing::debug!(error = %e, attempt, "request failed, retrying");
            }
            Err(e) => return Err(ArgusError::Http(e)),
        }
        attempt += 1;
        if !policy.pause.is_zero() {
            tokio::time::sleep(policy.pause).await;
        }
    }
}

/// Return the body of a 2XX response, or an error naming the status.
pub async fn ok_body(service: &str, resp: Response) -> Result<String> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(ArgusError::Query {
            service: service.to_string(),
            reason: format!("non-2XX response ({status}): {}", truncate(&body, 200)),
        });
    }
    Ok(body)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retries_server_errors_then_returns_last_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;
        let client = build_client(false).unwrap();
        let url = format!("{}/flaky", server.url());
        let resp = send_with_retries(RetryPolicy::immediate(3), || client.get(&url))
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 503);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;
        let client = build_client(false).unwrap();
        let url = format!("{}/missing", server.url());
        let resp = send_with_retries(RetryPolicy::immediate(3), || client.get(&url))
            .await
            .unwrap();
        let err = ok_body("svc", resp).await.unwrap_err();
        assert!(err.to_string().contains("404"), "{err}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn decorate_sends_headers_and_basic_auth() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header("x-test", "yes")
            .match_header("authorization", "Basic dXNlcjpwYXNz")
            .with_body("ok")
            .create_async()
            .await;
        let client = build_client(false).unwrap();
        let headers = vec![Header {
            key: "X-Test".into(),
            value: "yes".into(),
        }];
        let auth = BasicAuth {
            username: "user".into(),
            password: "pass".into(),
        };
        let url = server.url();
        let resp = send_with_retries(RetryPolicy::default(), || {
            decorate(client.get(&url), &headers, Some(&auth))
        })
        .await
        .unwrap();
        assert_eq!(ok_body("svc", resp).await.unwrap(), "ok");
        mock.assert_async().await;
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
