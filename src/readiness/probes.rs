use super::{ProbeContext, ReadinessProbe};
use crate::error::{Error, Result};
use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;

const INITIAL_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(2);
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Repeat `check` with exponential backoff until it succeeds or the probe is cancelled.
///
/// Starts at 50ms and doubles up to 2s between attempts. On cancellation the
/// last check error is returned.
pub async fn poll_until<F, Fut>(ctx: &ProbeContext, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut current_delay = INITIAL_POLL_INTERVAL;
    loop {
        let last_error = match check().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(last_error),
            _ = tokio::time::sleep(current_delay) => {}
        }
        current_delay = std::cmp::min(current_delay * 2, MAX_POLL_INTERVAL);
    }
}

impl ReadinessProbe {
    /// Ready once a TCP connection to `port` on the service's hostname succeeds.
    pub fn tcp(port: u16) -> Self {
        Self::new(format!("tcp:{}", port), move |ctx: ProbeContext| async move {
            let address = format!("{}:{}", ctx.hostname, port);
            let address = address.as_str();
            poll_until(&ctx, || async move {
                TcpStream::connect(address)
                    .await
                    .map(drop)
                    .map_err(|e| anyhow::anyhow!("connect to {} failed: {}", address, e))
            })
            .await
        })
    }

    /// Ready once `GET http://<hostname>:<port><path>` returns a 2xx status.
    pub fn http(port: u16, path: &str) -> Result<Self> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        // Validate with a placeholder host; the real one is only known after start.
        validate_url(&format!("http://localhost:{}{}", port, path))?;
        let client = build_client()?;

        Ok(Self::new(format!("http:{}{}", port, path), move |ctx: ProbeContext| {
            let url = format!("http://{}:{}{}", ctx.hostname, port, path);
            let client = client.clone();
            async move { poll_until(&ctx, || get_success(&client, &url)).await }
        }))
    }

    /// Ready once `GET url` returns a 2xx status. The URL is used verbatim.
    pub fn http_url(url: &str) -> Result<Self> {
        validate_url(url)?;
        let client = build_client()?;
        let url = url.to_string();

        Ok(Self::new(format!("http:{}", url), move |ctx: ProbeContext| {
            let url = url.clone();
            let client = client.clone();
            async move { poll_until(&ctx, || get_success(&client, &url)).await }
        }))
    }
}

async fn get_success(client: &Client, url: &str) -> anyhow::Result<()> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        anyhow::bail!("GET {} returned {}", url, status)
    }
}

// Each probe run gets its own runtime, so pooled connections can't be reused.
fn build_client() -> Result<Client> {
    Client::builder()
        .timeout(HTTP_REQUEST_TIMEOUT)
        .pool_max_idle_per_host(0)
        .build()
        .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))
}

/// Validate that a URL is well-formed and uses HTTP/HTTPS scheme.
fn validate_url(url: &str) -> Result<()> {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            if scheme != "http" && scheme != "https" {
                return Err(Error::Config(format!(
                    "Invalid readiness URL '{}': scheme must be http or https, got '{}'",
                    url, scheme
                )));
            }
            Ok(())
        }
        Err(e) => Err(Error::Config(format!(
            "Invalid readiness URL '{}': {}",
            url, e
        ))),
    }
}
