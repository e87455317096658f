//! GitHub REST client for the Publisher.
//!
//! Creates branches, pushes file contents and opens pull requests. It has
//! no merge capability at all: the API surface simply does not include
//! one.

use base64::Engine as _;
use neverdown_common::Secret;
use neverdown_config::Settings;
use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";

static URL_WITH_HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"github\.com[:/]([^/]+)/([^/.\s]+)").expect("regex compiles"));

static OWNER_REPO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^/\s]+)/([^/\s]+)$").expect("regex compiles"));

/// Errors from the git-host API.
#[derive(Debug, thiserror::Error)]
pub enum GithubError {
    #[error("GitHub API error ({status}): {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("could not parse repository URL: {0}")]
    BadRepoUrl(String),
}

/// A created or fetched pull request.
#[derive(Debug, Clone)]
pub struct RemotePullRequest {
    pub number: u64,
    pub url: String,
    pub state: String,
    pub merged: bool,
}

/// Request to open a pull request.
#[derive(Debug, Clone)]
pub struct CreatePullRequest {
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
    pub draft: bool,
}

pub struct GithubClient {
    client: reqwest::Client,
    base_url: String,
    token: Secret,
}

impl GithubClient {
    #[must_use]
    pub fn new(token: Secret, timeout_secs: u64, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            token,
        }
    }

    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.github_token.clone(),
            settings.github_rpc_timeout_secs,
            None,
        )
    }

    /// Extract `(owner, repo)` from an HTTPS / scp-like URL or a plain
    /// `owner/repo` string.
    pub fn parse_repo_url(url: &str) -> Result<(String, String), GithubError> {
        if let Some(caps) = URL_WITH_HOST.captures(url) {
            return Ok((caps[1].to_string(), caps[2].trim_end_matches(".git").to_string()));
        }
        if let Some(caps) = OWNER_REPO.captures(url.trim()) {
            return Ok((caps[1].to_string(), caps[2].trim_end_matches(".git").to_string()));
        }
        Err(GithubError::BadRepoUrl(url.to_string()))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .header("User-Agent", "neverdown");
        if !self.token.is_empty() {
            builder = builder.bearer_auth(self.token.expose());
        }
        builder
    }

    async fn json_or_error(response: reqwest::Response) -> Result<serde_json::Value, GithubError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GithubError::Http {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| GithubError::Request(e.to_string()))
    }

    /// Default branch of the repository.
    pub async fn default_branch(&self, owner: &str, repo: &str) -> Result<String, GithubError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/repos/{owner}/{repo}"))
            .send()
            .await
            .map_err(|e| GithubError::Request(e.to_string()))?;
        let data = Self::json_or_error(response).await?;
        Ok(data["default_branch"].as_str().unwrap_or("main").to_string())
    }

    /// Commit SHA a ref points at, e.g. `heads/main`.
    pub async fn ref_sha(&self, owner: &str, repo: &str, git_ref: &str) -> Result<String, GithubError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{owner}/{repo}/git/ref/{git_ref}"),
            )
            .send()
            .await
            .map_err(|e| GithubError::Request(e.to_string()))?;
        let data = Self::json_or_error(response).await?;
        Ok(data["object"]["sha"].as_str().unwrap_or_default().to_string())
    }

    /// Create a branch from a SHA. A pre-existing branch is not an error.
    pub async fn create_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        base_sha: &str,
    ) -> Result<(), GithubError> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{owner}/{repo}/git/refs"),
            )
            .json(&json!({
                "ref": format!("refs/heads/{branch}"),
                "sha": base_sha,
            }))
            .send()
            .await
            .map_err(|e| GithubError::Request(e.to_string()))?;

        if response.status().as_u16() == 422 {
            info!(branch, "Branch already exists");
            return Ok(());
        }
        Self::json_or_error(response).await.map(|_| ())
    }

    /// Create or update one file on a branch via the contents RPC.
    /// Updates require the prior blob SHA, which is fetched first.
    pub async fn put_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        file_path: &str,
        content: &str,
        message: &str,
    ) -> Result<String, GithubError> {
        let existing_sha = self.file_sha(owner, repo, branch, file_path).await;

        let mut payload = json!({
            "message": message,
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "branch": branch,
        });
        if let Some(sha) = existing_sha {
            payload["sha"] = json!(sha);
        }

        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/repos/{owner}/{repo}/contents/{file_path}"),
            )
            .json(&payload)
            .send()
            .await
            .map_err(|e| GithubError::Request(e.to_string()))?;
        let data = Self::json_or_error(response).await?;
        Ok(data["commit"]["sha"].as_str().unwrap_or_default().to_string())
    }

    async fn file_sha(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        file_path: &str,
    ) -> Option<String> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{owner}/{repo}/contents/{file_path}"),
            )
            .query(&[("ref", branch)])
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let data: serde_json::Value = response.json().await.ok()?;
        data["sha"].as_str().map(String::from)
    }

    /// Open a pull request. Never merges.
    pub async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        request: &CreatePullRequest,
    ) -> Result<RemotePullRequest, GithubError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/repos/{owner}/{repo}/pulls"))
            .json(&json!({
                "title": request.title,
                "body": request.body,
                "head": request.head_branch,
                "base": request.base_branch,
                "draft": request.draft,
            }))
            .send()
            .await
            .map_err(|e| GithubError::Request(e.to_string()))?;
        let data = Self::json_or_error(response).await?;

        Ok(RemotePullRequest {
            number: data["number"].as_u64().unwrap_or_default(),
            url: data["html_url"].as_str().unwrap_or_default().to_string(),
            state: data["state"].as_str().unwrap_or("open").to_string(),
            merged: data["merged"].as_bool().unwrap_or(false),
        })
    }

    /// Add labels to a PR. Failures are logged and swallowed: labels are
    /// cosmetic, the PR itself already exists.
    pub async fn add_labels(&self, owner: &str, repo: &str, pr_number: u64, labels: &[String]) {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{owner}/{repo}/issues/{pr_number}/labels"),
            )
            .json(&json!({"labels": labels}))
            .send()
            .await;

        match response {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => warn!(pr_number, status = r.status().as_u16(), "Failed to add labels"),
            Err(e) => warn!(pr_number, "Failed to add labels: {e}"),
        }
    }

    /// Fetch a pull request by number.
    pub async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<RemotePullRequest, GithubError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{owner}/{repo}/pulls/{pr_number}"),
            )
            .send()
            .await
            .map_err(|e| GithubError::Request(e.to_string()))?;
        let data = Self::json_or_error(response).await?;

        Ok(RemotePullRequest {
            number: data["number"].as_u64().unwrap_or_default(),
            url: data["html_url"].as_str().unwrap_or_default().to_string(),
            state: data["state"].as_str().unwrap_or_default().to_string(),
            merged: data["merged"].as_bool().unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GithubClient {
        GithubClient::new(Secret::new("ghp_test"), 5, Some(server.uri()))
    }

    #[test]
    fn test_parse_repo_url_forms() {
        assert_eq!(
            GithubClient::parse_repo_url("https://github.com/acme/widget").unwrap(),
            ("acme".to_string(), "widget".to_string())
        );
        assert_eq!(
            GithubClient::parse_repo_url("git@github.com:acme/widget.git").unwrap(),
            ("acme".to_string(), "widget".to_string())
        );
        assert_eq!(
            GithubClient::parse_repo_url("acme/widget").unwrap(),
            ("acme".to_string(), "widget".to_string())
        );
        assert!(GithubClient::parse_repo_url("not a url at all").is_err());
    }

    #[tokio::test]
    async fn test_default_branch_and_ref() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widget"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"default_branch": "trunk"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widget/git/ref/heads/trunk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": {"sha": "abc123"}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(client.default_branch("acme", "widget").await.unwrap(), "trunk");
        assert_eq!(
            client.ref_sha("acme", "widget", "heads/trunk").await.unwrap(),
            "abc123"
        );
    }

    #[tokio::test]
    async fn test_existing_branch_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widget/git/refs"))
            .respond_with(
                ResponseTemplate::new(422).set_body_json(json!({"message": "Reference already exists"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        client
            .create_branch("acme", "widget", "neverdown/fix-x", "abc")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_file_includes_prior_sha_for_update() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widget/contents/src/app.py"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sha": "oldsha"})))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/repos/acme/widget/contents/src/app.py"))
            .and(body_partial_json(json!({"sha": "oldsha", "branch": "fix"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "commit": {"sha": "newsha"}
            })))
            .mount(&server)
            .await;

        let sha = client_for(&server)
            .put_file("acme", "widget", "fix", "src/app.py", "content", "msg")
            .await
            .unwrap();
        assert_eq!(sha, "newsha");
    }

    #[tokio::test]
    async fn test_create_pull_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widget/pulls"))
            .and(body_partial_json(json!({"head": "fix", "base": "main", "draft": false})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "number": 7,
                "html_url": "https://github.com/acme/widget/pull/7",
                "state": "open",
            })))
            .mount(&server)
            .await;

        let pr = client_for(&server)
            .create_pull_request(
                "acme",
                "widget",
                &CreatePullRequest {
                    title: "t".to_string(),
                    body: "b".to_string(),
                    head_branch: "fix".to_string(),
                    base_branch: "main".to_string(),
                    draft: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(pr.number, 7);
        assert!(pr.url.ends_with("/pull/7"));
    }

    #[tokio::test]
    async fn test_api_error_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widget"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .default_branch("acme", "widget")
            .await
            .unwrap_err();
        assert!(matches!(err, GithubError::Http { status: 404, .. }));
    }
}
