//! GitHub REST v3 client, as a `HostAdapter`.
//!
//! Tracks the list-PRs ETag so a quiet repo costs one conditional GET per
//! poll instead of a full payload, and tracks rate-limit headers for
//! observability. `set_commit_status` reads existing statuses for the sha
//! first and skips the POST when `(state, description, target_url)` already
//! match for the given context.

use anyhow::{anyhow, bail, Context as _, Result};
use async_trait::async_trait;
use pr_orchestrator_core::adapters::{CommitStatus, HostAdapter};
use pr_orchestrator_core::types::PrDescriptor;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

const GITHUB_API: &str = "https://api.github.com";
const TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhRepo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhRef {
    #[serde(rename = "ref")]
    branch: String,
    sha: String,
    user: GhUser,
    repo: GhRepo,
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: i64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    user: GhUser,
    #[serde(default)]
    assignee: Option<GhUser>,
    base: GhRef,
    head: GhRef,
}

#[derive(Debug, Deserialize)]
struct GhCommitStatus {
    context: String,
    state: String,
    description: Option<String>,
    target_url: Option<String>,
}

#[derive(Default)]
struct ListCache {
    etag: Option<String>,
    prs: Option<Vec<PrDescriptor>>,
}

pub struct GitHubHostAdapter {
    client: Client,
    owner: String,
    repo: String,
    token: String,
    list_cache: Mutex<ListCache>,
}

impl GitHubHostAdapter {
    pub fn new(owner: String, repo: String, token: String, user_agent: &str) -> Result<Self> {
        let mut builder = Client::builder().timeout(TIMEOUT).user_agent(user_agent.to_string());
        if let Ok(proxy_url) = std::env::var("http_proxy") {
            if !proxy_url.is_empty() {
                builder = builder.proxy(reqwest::Proxy::http(&proxy_url)?);
            }
        }
        let client = builder.build().context("building GitHub HTTP client")?;
        Ok(Self {
            client,
            owner,
            repo,
            token,
            list_cache: Mutex::new(ListCache::default()),
        })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.token.is_empty() {
            req
        } else {
            req.header("Authorization", format!("token {}", self.token))
        }
    }

    fn track_rate_limit(&self, resp: &reqwest::Response) {
        if let Some(remaining) = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
        {
            debug!(remaining, "GitHub rate limit remaining");
        }
    }
}

#[async_trait]
impl HostAdapter for GitHubHostAdapter {
    async fn list_open_pull_requests(&self) -> Result<Vec<PrDescriptor>> {
        let url = format!("{GITHUB_API}/repos/{}/{}/pulls?state=open", self.owner, self.repo);
        let prior_etag = { self.list_cache.lock().unwrap().etag.clone() };

        let mut req = self.authed(self.client.get(&url));
        if let Some(etag) = &prior_etag {
            req = req.header("If-None-Match", etag.clone());
        }
        let resp = req.send().await.context("GET pulls")?;
        self.track_rate_limit(&resp);

        if resp.status() == StatusCode::NOT_MODIFIED {
            let cached = self.list_cache.lock().unwrap().prs.clone();
            return Ok(cached.unwrap_or_default());
        }
        if resp.status() == StatusCode::NOT_FOUND {
            bail!("repository {}/{} not found", self.owner, self.repo);
        }
        if !resp.status().is_success() {
            bail!("GET pulls returned {}", resp.status());
        }

        let etag = resp
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: Vec<GhPullRequest> = resp.json().await.context("decoding pulls response")?;

        let descriptors: Vec<PrDescriptor> = body
            .into_iter()
            .map(|pr| PrDescriptor {
                id: pr.number,
                branch: pr.base.branch,
                author: pr.user.login,
                assignee: pr.assignee.map(|a| a.login).unwrap_or_default(),
                head_user: pr.head.user.login,
                head_repo: pr.head.repo.name,
                head_branch: pr.head.branch,
                head_sha: pr.head.sha,
                title: pr.title,
                description: pr.body.unwrap_or_default(),
                priority: 0,
                info: json!({}),
            })
            .collect();

        let mut cache = self.list_cache.lock().unwrap();
        cache.etag = etag;
        cache.prs = Some(descriptors.clone());
        Ok(descriptors)
    }

    async fn set_commit_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: CommitStatus,
    ) -> Result<()> {
        let list_url = format!("{GITHUB_API}/repos/{owner}/{repo}/commits/{sha}/statuses");
        match self.authed(self.client.get(&list_url)).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<Vec<GhCommitStatus>>().await {
                    Ok(existing) => {
                        if status_already_set(&existing, &status) {
                            debug!(sha, "commit status already up to date, skipping");
                            return Ok(());
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to decode existing commit statuses, posting anyway"),
                }
            }
            Ok(resp) => warn!(status = %resp.status(), "failed to list existing commit statuses, posting anyway"),
            Err(e) => warn!(error = %e, "failed to list existing commit statuses, posting anyway"),
        }

        let post_url = format!("{GITHUB_API}/repos/{owner}/{repo}/statuses/{sha}");
        let body = json!({
            "state": status.state,
            "target_url": status.target_url,
            "description": status.description,
            "context": status.context,
        });
        let resp = self
            .authed(self.client.post(&post_url).json(&body))
            .send()
            .await
            .context("POST commit status")?;
        if !resp.status().is_success() {
            return Err(anyhow!("POST commit status returned {}", resp.status()));
        }
        info!(sha, state = %status.state, "commit status updated");
        Ok(())
    }
}

fn status_already_set(existing: &[GhCommitStatus], status: &CommitStatus) -> bool {
    existing.iter().any(|s| {
        s.context == status.context
            && s.state == status.state
            && s.description.as_deref() == Some(status.description.as_str())
            && s.target_url.as_deref() == Some(status.target_url.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_status() -> CommitStatus {
        CommitStatus {
            state: "success".into(),
            description: "build passed".into(),
            target_url: "https://ci.example.com/42".into(),
            context: "ci/orchestrator".into(),
        }
    }

    #[test]
    fn status_already_set_matches_on_all_four_fields() {
        let existing = vec![GhCommitStatus {
            context: "ci/orchestrator".into(),
            state: "success".into(),
            description: Some("build passed".into()),
            target_url: Some("https://ci.example.com/42".into()),
        }];
        assert!(status_already_set(&existing, &sample_status()));
    }

    #[test]
    fn status_already_set_ignores_different_context() {
        let existing = vec![GhCommitStatus {
            context: "ci/other".into(),
            state: "success".into(),
            description: Some("build passed".into()),
            target_url: Some("https://ci.example.com/42".into()),
        }];
        assert!(!status_already_set(&existing, &sample_status()));
    }

    #[test]
    fn status_already_set_detects_description_change() {
        let existing = vec![GhCommitStatus {
            context: "ci/orchestrator".into(),
            state: "success".into(),
            description: Some("stale description".into()),
            target_url: Some("https://ci.example.com/42".into()),
        }];
        assert!(!status_already_set(&existing, &sample_status()));
    }
}
