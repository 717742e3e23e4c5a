// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tpmreg Authors

use reqwest::{Client, Method, Response, StatusCode};
use reqwest_middleware::{
    ClientBuilder, ClientWithMiddleware, Error, RequestBuilder,
};
use reqwest_retry::{
    policies::ExponentialBackoff, RetryTransientMiddleware, Retryable,
    RetryableStrategy,
};
use serde::Serialize;
use std::time::Duration;

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Retry settings for registrar requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: Option<u64>,
}

/// Retries only what a second attempt could fix: network failures, server
/// errors and rate limiting. Any other answer is final.
#[derive(Clone)]
struct TransientOnlyStrategy;

impl RetryableStrategy for TransientOnlyStrategy {
    fn handle(&self, res: &Result<Response, Error>) -> Option<Retryable> {
        match res {
            Ok(response) => {
                let status = response.status();
                if status.is_server_error()
                    || status == StatusCode::TOO_MANY_REQUESTS
                {
                    Some(Retryable::Transient)
                } else {
                    None
                }
            }
            // If there was a network error, it's always a transient error.
            Err(_) => Some(Retryable::Transient),
        }
    }
}

/// A client that transparently handles retries with exponential backoff.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    client: ClientWithMiddleware,
}

impl ResilientClient {
    /// Creates a new client with a defined retry strategy.
    ///
    /// With `max_retries` set to 0 every request is sent exactly once.
    pub fn new(
        client: Option<Client>,
        initial_delay: Duration,
        max_retries: u32,
        max_delay: Option<Duration>,
    ) -> Self {
        let base_client = client.unwrap_or_default();
        let final_max_delay = max_delay.unwrap_or(DEFAULT_MAX_DELAY);

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(initial_delay, final_max_delay)
            .build_with_max_retries(max_retries);

        let client_with_middleware = ClientBuilder::new(base_client)
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                retry_policy,
                TransientOnlyStrategy,
            ))
            .build();

        Self {
            client: client_with_middleware,
        }
    }

    pub fn from_config(client: Option<Client>, config: &RetryConfig) -> Self {
        Self::new(
            client,
            Duration::from_millis(config.initial_delay_ms),
            config.max_retries,
            config.max_delay_ms.map(Duration::from_millis),
        )
    }

    /// Prepares a request without body
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Prepares a request with a JSON body, returning a Result.
    pub fn send_json<T: Serialize>(
        &self,
        method: Method,
        url: &str,
        json_serializable: &T,
    ) -> Result<RequestBuilder, serde_json::Error> {
        let body_as_string = serde_json::to_string(json_serializable)?;

        let builder = self
            .client
            .request(method, url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body_as_string);

        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retries(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_ms: 10,
            max_delay_ms: Some(50),
        }
    }

    async fn request_count(server: &MockServer) -> usize {
        server.received_requests().await.unwrap().len() //#[allow_ci]
    }

    #[tokio::test]
    async fn test_json_body_and_headers() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/agents/agent"))
            .and(header("Content-Type", "application/json"))
            .and(body_json(json!({"aik": "aik"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = ResilientClient::from_config(None, &fast_retries(0));
        let response = client
            .send_json(
                Method::POST,
                &format!("{}/v2/agents/agent", mock_server.uri()),
                &json!({"aik": "aik"}),
            )
            .unwrap() //#[allow_ci]
            .send()
            .await
            .unwrap(); //#[allow_ci]

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_transient_statuses_are_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v2/agents/agent/activate"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2/agents/agent/activate"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2/agents/agent/activate"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;

        let client = ResilientClient::from_config(None, &fast_retries(3));
        let response = client
            .send_json(
                Method::PUT,
                &format!("{}/v2/agents/agent/activate", mock_server.uri()),
                &json!({"auth_tag": "00"}),
            )
            .unwrap() //#[allow_ci]
            .send()
            .await
            .unwrap(); //#[allow_ci]

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(request_count(&mock_server).await, 3);
    }

    #[tokio::test]
    async fn test_rejections_are_final() {
        let mock_server = MockServer::start().await;
        for code in [400, 404, 405] {
            Mock::given(method("GET"))
                .and(path(format!("/v2/agents/{code}")))
                .respond_with(ResponseTemplate::new(code))
                .mount(&mock_server)
                .await;
        }

        let client = ResilientClient::from_config(None, &fast_retries(3));
        for code in [400, 404, 405] {
            let response = client
                .request(
                    Method::GET,
                    &format!("{}/v2/agents/{code}", mock_server.uri()),
                )
                .send()
                .await
                .unwrap(); //#[allow_ci]
            assert_eq!(response.status().as_u16(), code);
        }

        // One request per answer, none repeated
        assert_eq!(request_count(&mock_server).await, 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mock_server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let client = ResilientClient::from_config(None, &fast_retries(2));
        let response = client
            .request(
                Method::DELETE,
                &format!("{}/v2/agents/agent", mock_server.uri()),
            )
            .send()
            .await
            .unwrap(); //#[allow_ci]

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(request_count(&mock_server).await, 3);

        // Without retries the failure is returned right away
        let mock_server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let client = ResilientClient::from_config(None, &fast_retries(0));
        let _ = client
            .request(Method::DELETE, &mock_server.uri())
            .send()
            .await
            .unwrap(); //#[allow_ci]
        assert_eq!(request_count(&mock_server).await, 1);
    }

    #[tokio::test]
    async fn test_unreachable_registrar() {
        // Bind and drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap() //#[allow_ci]
            .local_addr()
            .unwrap() //#[allow_ci]
            .port();

        let client = ResilientClient::from_config(None, &fast_retries(1));
        let response = client
            .request(Method::GET, &format!("http://127.0.0.1:{port}/"))
            .send()
            .await;

        assert!(response.is_err());
    }
}
