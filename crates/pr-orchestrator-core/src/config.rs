use crate::types::BuilderConfig;
use anyhow::Result;
use std::collections::HashMap;

/// Full application configuration, loaded from environment / .env file.
///
/// Mirrors the original `Context` record: a value-typed struct passed by
/// reference to every component, not module-level mutable state.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub dbname: String,
    pub urlpath: String,
    pub update_pull_requests_delay_s: u64,
    pub trusted_authors: Option<Vec<String>>,
    pub reviewers: Option<Vec<String>>,
    pub builders: HashMap<String, BuilderConfig>,
    /// Whether interrupted SCHEDULING/BUILDING statuses are reset to INQUEUE
    /// on startup. Off by default.
    pub reset_interrupted_on_startup: bool,

    // Host adapter
    pub github_token: String,
    pub github_owner: String,
    pub github_repo: String,

    // Executor adapter
    pub executor_base_url: String,

    // HTTP server
    pub bind: String,
    pub port: u16,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// `name1:internal1:order1[:perf],name2:internal2:order2[:perf]|...` style
/// pipe-delimited builder list, matching this codebase's dotenv-based config
/// parsing convention. Each logical builder may target more than one executor
/// builder name, separated by `+`.
fn parse_builders(raw: &str) -> HashMap<String, BuilderConfig> {
    let mut builders = HashMap::new();
    if raw.is_empty() {
        return builders;
    }
    for (idx, entry) in raw.split('|').enumerate() {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let parts: Vec<&str> = entry.split(':').collect();
        let name = parts.first().copied().unwrap_or("").to_string();
        if name.is_empty() {
            continue;
        }
        let internal_name = parts.get(1).copied().unwrap_or(&name).to_string();
        let order: i64 = parts
            .get(2)
            .and_then(|s| s.parse().ok())
            .unwrap_or(idx as i64);
        let is_perf = parts.get(3).copied() == Some("perf");
        let targets: Vec<String> = name.split('+').map(str::to_string).collect();
        builders.insert(
            internal_name.clone(),
            BuilderConfig {
                internal_name,
                name: name.clone(),
                builders: targets,
                order,
                is_perf,
            },
        );
    }
    builders
}

fn parse_name_list(raw: &str) -> Option<Vec<String>> {
    if raw.is_empty() {
        return None;
    }
    Some(
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        Ok(Config {
            name: get_str("PR_SERVICE_NAME", &dotenv, "Pull Requests"),
            dbname: get_str("PR_DBNAME", &dotenv, "pullrequests"),
            urlpath: get_str("PR_URLPATH", &dotenv, "pullrequests"),
            update_pull_requests_delay_s: get_u64("UPDATE_PULL_REQUESTS_DELAY_S", &dotenv, 120),
            trusted_authors: parse_name_list(&get_str("TRUSTED_AUTHORS", &dotenv, "")),
            reviewers: parse_name_list(&get_str("REVIEWERS", &dotenv, "")),
            builders: parse_builders(&get_str("BUILDERS", &dotenv, "")),
            reset_interrupted_on_startup: get_bool(
                "RESET_INTERRUPTED_ON_STARTUP",
                &dotenv,
                false,
            ),
            github_token: get_str("GITHUB_TOKEN", &dotenv, ""),
            github_owner: get_str("GITHUB_OWNER", &dotenv, ""),
            github_repo: get_str("GITHUB_REPO", &dotenv, ""),
            executor_base_url: get_str("EXECUTOR_BASE_URL", &dotenv, ""),
            bind: get_str("BIND", &dotenv, "127.0.0.1"),
            port: get_u16("PORT", &dotenv, 8010),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_builders_splits_pipe_entries() {
        let builders = parse_builders("linux:b-linux:0|linux-perf:b-perf:1:perf");
        assert_eq!(builders.len(), 2);
        assert!(builders["b-linux"].builders.contains(&"linux".to_string()));
        assert!(builders["b-perf"].is_perf);
    }

    #[test]
    fn parse_name_list_empty_is_none() {
        assert!(parse_name_list("").is_none());
        assert_eq!(
            parse_name_list("alice, bob"),
            Some(vec!["alice".into(), "bob".into()])
        );
    }
}
