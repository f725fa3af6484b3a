// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP transport to the collector.
//!
//! Clients honor the configured request timeout and HTTPS proxy. A proxy that cannot be
//! parsed is logged and skipped rather than failing delivery.

use crate::config::Config;
use core::time::Duration;
use reqwest::header::CONTENT_TYPE;
use reqwest::Response;
use std::error::Error;
use tracing::{debug, error};

pub const ACCESS_TOKEN_HEADER: &str = "X-Rollbar-Access-Token";

/// Creates a client for `config`, falling back to a direct connection when the proxy is
/// invalid.
#[must_use]
pub fn get_client(config: &Config) -> reqwest::Client {
    match build_client(config) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client_without_proxy(config) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(config: &Config) -> Result<reqwest::Client, Box<dyn Error>> {
    build_client_inner(config, true)
}

fn build_client_without_proxy(config: &Config) -> Result<reqwest::Client, Box<dyn Error>> {
    build_client_inner(config, false)
}

fn build_client_inner(config: &Config, allow_proxy: bool) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if allow_proxy {
        if let Some(https_uri) = &config.proxy {
            let proxy = reqwest::Proxy::https(https_uri.clone())?;
            client = client.proxy(proxy);
        }
    }

    Ok(client.build()?)
}

/// POSTs a serialized payload to `endpoint`.
///
/// Any response, whatever its status, is returned to the caller; only transport failures
/// are errors.
pub async fn post_payload(
    client: &reqwest::Client,
    endpoint: &str,
    access_token: &str,
    body: String,
) -> Result<Response, reqwest::Error> {
    debug!("Sending payload of {} bytes to {}", body.len(), endpoint);
    client
        .post(endpoint)
        .header(ACCESS_TOKEN_HEADER, access_token)
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[test]
    fn test_invalid_proxy_falls_back() {
        let config = Config {
            proxy: Some("::not a url::".to_string()),
            ..Default::default()
        };
        // Must not panic; the proxy is dropped.
        let _client = get_client(&config);
    }

    #[tokio::test]
    async fn test_post_payload_sends_token_and_json() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/1/item/")
            .match_header(ACCESS_TOKEN_HEADER, "secret")
            .match_header("content-type", "application/json")
            .match_body(Matcher::JsonString(r#"{"data":{"level":"info"}}"#.to_string()))
            .with_status(200)
            .create_async()
            .await;

        let client = get_client(&Config::default());
        let response = post_payload(
            &client,
            &format!("{}/api/1/item/", server.url()),
            "secret",
            r#"{"data":{"level":"info"}}"#.to_string(),
        )
        .await
        .expect("request should complete");

        assert_eq!(response.status(), 200);
        mock.assert_async().await;
    }
}
