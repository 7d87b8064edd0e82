// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP health polling for dev servers.

use std::time::Duration;

use reqwest::{redirect, Client};
use tracing::{debug, warn};

use crate::config::PreviewConfig;
use crate::error::PreviewError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls a URL with capped exponential backoff until it answers 2xx/3xx.
#[derive(Clone)]
pub struct HealthProber {
    client: Client,
    attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl HealthProber {
    pub fn new(attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        // Redirects count as healthy, so they are never followed.
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build health client ({}), using defaults", e);
                Client::new()
            });
        Self {
            client,
            attempts: attempts.max(1),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    pub fn from_config(config: &PreviewConfig) -> Self {
        Self::new(
            config.health_attempts,
            Duration::from_millis(config.health_initial_delay_ms),
            Duration::from_millis(config.health_max_delay_ms),
        )
    }

    /// One request. Any transport error is unhealthy.
    pub async fn check_once(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                debug!(url, status = status.as_u16(), "Health probe");
                status.is_success() || status.is_redirection()
            }
            Err(e) => {
                debug!(url, "Health probe failed: {}", e);
                false
            }
        }
    }

    /// Probe until healthy or the attempt budget runs out.
    pub async fn probe(&self, url: &str) -> Result<(), PreviewError> {
        let mut delay = self.initial_delay;
        for attempt in 1..=self.attempts {
            if self.check_once(url).await {
                return Ok(());
            }
            if attempt < self.attempts {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.max_delay);
            }
        }
        Err(PreviewError::HealthCheckFailed {
            url: url.to_string(),
            attempts: self.attempts,
        })
    }

    /// The URL to probe for a local port.
    pub fn local_url(port: u16) -> String {
        format!("http://localhost:{}", port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve(status_line: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nLocation: /x\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status_line
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    fn fast() -> HealthProber {
        HealthProber::new(3, Duration::from_millis(10), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_ok_and_redirect_are_healthy() {
        let ok = serve("200 OK").await;
        let redirect = serve("302 Found").await;
        let prober = fast();
        assert!(prober.probe(&HealthProber::local_url(ok)).await.is_ok());
        assert!(prober.check_once(&HealthProber::local_url(redirect)).await);
    }

    #[tokio::test]
    async fn test_server_error_exhausts_attempts() {
        let port = serve("500 Internal Server Error").await;
        let err = fast().probe(&HealthProber::local_url(port)).await.unwrap_err();
        assert!(matches!(err, PreviewError::HealthCheckFailed { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_nothing_listening() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!fast().check_once(&HealthProber::local_url(port)).await);
    }
}
