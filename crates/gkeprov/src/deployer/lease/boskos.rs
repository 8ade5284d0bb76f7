use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::deployer::DeployResult;
use crate::deployer::config::get_broker_request_timeout;
use crate::deployer::lease::{BrokerFuture, ResourceBroker};

const STATE_FREE: &str = "free";
const STATE_BUSY: &str = "busy";
const STATE_DIRTY: &str = "dirty";

/// Resource as returned by the Boskos API.
#[derive(Debug, Deserialize)]
struct BoskosResource {
    name: String,
    #[serde(rename = "type", default)]
    resource_type: String,
    #[serde(default)]
    state: String,
}

/// HTTP client of a [Boskos](https://github.com/kubernetes-sigs/boskos) server.
///
/// Acquired resources are moved from `free` to `busy`, released resources are returned as `dirty`
/// so that the janitor can clean them up.
pub struct BoskosClient {
    client: reqwest::Client,
    url: String,
    owner: String,
}

impl BoskosClient {
    pub fn new(url: &str, owner: String) -> DeployResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(get_broker_request_timeout())
            .build()
            .context("Cannot create Boskos HTTP client")?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            owner,
        })
    }

    /// Owner name used when none is configured.
    pub fn default_owner() -> String {
        gethostname::gethostname().to_string_lossy().into_owned()
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.url)
    }

    fn post(&self, path: &str, query: &[(&str, &str)]) -> reqwest::RequestBuilder {
        let mut params = query.to_vec();
        params.push(("owner", self.owner.as_str()));
        self.client.post(self.endpoint(path)).query(&params)
    }
}

async fn check_status(
    response: reqwest::Response,
    action: &str,
) -> DeployResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("Boskos {action} request failed with status {status}: {body}")
    }
}

impl ResourceBroker for BoskosClient {
    fn acquire(&self, resource_type: &str) -> BrokerFuture<Option<String>> {
        let request = self.post(
            "acquire",
            &[
                ("type", resource_type),
                ("state", STATE_FREE),
                ("dest", STATE_BUSY),
            ],
        );
        Box::pin(async move {
            let response = request
                .send()
                .await
                .context("Cannot send acquire request to Boskos")?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let resource: BoskosResource = check_status(response, "acquire")
                .await?
                .json()
                .await
                .context("Cannot parse resource returned by Boskos")?;
            log::debug!(
                "Boskos handed out resource {} (type `{}`, state `{}`)",
                resource.name,
                resource.resource_type,
                resource.state
            );
            Ok(Some(resource.name))
        })
    }

    fn heartbeat(&self, name: &str) -> BrokerFuture<()> {
        let request = self.post("update", &[("name", name), ("state", STATE_BUSY)]);
        Box::pin(async move {
            let response = request
                .send()
                .await
                .context("Cannot send update request to Boskos")?;
            check_status(response, "update").await?;
            Ok(())
        })
    }

    fn release(&self, name: &str) -> BrokerFuture<()> {
        let request = self.post("release", &[("name", name), ("dest", STATE_DIRTY)]);
        Box::pin(async move {
            let response = request
                .send()
                .await
                .context("Cannot send release request to Boskos")?;
            check_status(response, "release").await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::BoskosClient;
    use crate::deployer::lease::ResourceBroker;

    /// Serves a single HTTP request with the given response and returns the request head.
    async fn serve_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let read = socket.read(&mut buffer).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8(request).unwrap()
        });
        (url, server)
    }

    #[test]
    fn endpoint_without_trailing_slash() {
        let client = BoskosClient::new("http://boskos/", "me".to_string()).unwrap();
        assert_eq!(client.endpoint("acquire"), "http://boskos/acquire");
    }

    #[tokio::test]
    async fn acquire_free_resource() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"type":"gke-project","name":"project-1","state":"busy","owner":"ci"}"#,
        )
        .await;
        let client = BoskosClient::new(&url, "ci".to_string()).unwrap();
        let project = client.acquire("gke-project").await.unwrap();
        assert_eq!(project.as_deref(), Some("project-1"));

        let request = server.await.unwrap();
        let line = request.lines().next().unwrap();
        assert!(line.starts_with("POST /acquire?"));
        assert!(line.contains("type=gke-project"));
        assert!(line.contains("state=free"));
        assert!(line.contains("dest=busy"));
        assert!(line.contains("owner=ci"));
    }

    #[tokio::test]
    async fn acquire_nothing_free() {
        let (url, server) = serve_once("404 Not Found", "").await;
        let client = BoskosClient::new(&url, "ci".to_string()).unwrap();
        assert_eq!(client.acquire("gke-project").await.unwrap(), None);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn release_as_dirty() {
        let (url, server) = serve_once("200 OK", "").await;
        let client = BoskosClient::new(&url, "ci".to_string()).unwrap();
        client.release("project-1").await.unwrap();

        let request = server.await.unwrap();
        let line = request.lines().next().unwrap();
        assert!(line.starts_with("POST /release?"));
        assert!(line.contains("name=project-1"));
        assert!(line.contains("dest=dirty"));
    }

    #[tokio::test]
    async fn heartbeat_rejected() {
        let (url, server) = serve_once("409 Conflict", "owner mismatch").await;
        let client = BoskosClient::new(&url, "ci".to_string()).unwrap();
        let error = client.heartbeat("project-1").await.unwrap_err();
        assert!(format!("{error:#}").contains("409"));
        server.await.unwrap();
    }
}
