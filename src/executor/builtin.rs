//! 内置动作：周报工作流（scan_directory → generate_report → post_summary）与 summarise_text
//!
//! 这些只是演示用的叶子函数，不接触协议状态；路径是否允许由执行端策略先行把关。

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use walkdir::WalkDir;

use super::registry::{ActionHandler, ActionOutput, ActionRegistry};
use crate::policy::paths::normalize;

const DEFAULT_SCAN_PATH: &str = "./demo_projects";
const RECENT_DAYS: i64 = 7;
const SUMMARY_CHARS: usize = 200;
const POST_SUMMARY_CHARS: usize = 500;

fn str_param<'a>(params: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn object(value: Value) -> ActionOutput {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// 注册全部内置动作；`base_dir` 与执行端策略的基准目录保持一致
pub fn register_builtin(registry: &mut ActionRegistry, base_dir: &Path) {
    registry.register(SummariseText);
    registry.register(ScanDirectory::new(base_dir));
    registry.register(GenerateReport::new(base_dir));
    registry.register(PostSummary);
}

pub struct SummariseText;

#[async_trait]
impl ActionHandler for SummariseText {
    fn name(&self) -> &str {
        "summarise_text"
    }

    fn description(&self) -> &str {
        "Summarise text. Params: {\"text\": string}; falls back to the previous step's report_text"
    }

    async fn handle(
        &self,
        params: Map<String, Value>,
        previous_output: ActionOutput,
    ) -> Result<ActionOutput, String> {
        let text = str_param(&params, "text")
            .or_else(|| str_param(&previous_output, "report_text"))
            .ok_or("summarise_text requires a text param")?;
        Ok(object(json!({
            "summary": truncate_chars(text.trim(), SUMMARY_CHARS),
            "chars": text.chars().count(),
        })))
    }
}

/// 在路径下查找 git 仓库并统计近 7 天修改过的文件
pub struct ScanDirectory {
    base_dir: PathBuf,
    home: PathBuf,
}

impl ScanDirectory {
    pub fn new(base_dir: &Path) -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.to_path_buf());
        Self {
            base_dir: base_dir.to_path_buf(),
            home,
        }
    }
}

fn scan_repos(root: &Path, max_depth: usize) -> Vec<Value> {
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(RECENT_DAYS as u64 * 86_400))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut repo_dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir() && e.path().join(".git").is_dir())
        .map(|e| e.into_path())
        .collect();
    repo_dirs.sort();

    repo_dirs
        .iter()
        .map(|dir| {
            let mut files = 0usize;
            let mut recent: Vec<String> = Vec::new();
            for entry in WalkDir::new(dir)
                .into_iter()
                .filter_entry(|e| e.file_name() != ".git")
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                files += 1;
                let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
                if modified.is_some_and(|t| t >= cutoff) {
                    if let Ok(rel) = entry.path().strip_prefix(dir) {
                        recent.push(rel.to_string_lossy().to_string());
                    }
                }
            }
            recent.sort();
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            json!({
                "repo": name,
                "path": dir.to_string_lossy(),
                "files": files,
                "recent_changes": recent,
            })
        })
        .collect()
}

#[async_trait]
impl ActionHandler for ScanDirectory {
    fn name(&self) -> &str {
        "scan_directory"
    }

    fn description(&self) -> &str {
        "List git repositories under a path with recently changed files. Params: {\"path\": string, \"max_depth\": int}"
    }

    async fn handle(
        &self,
        params: Map<String, Value>,
        _previous_output: ActionOutput,
    ) -> Result<ActionOutput, String> {
        let raw = str_param(&params, "path").unwrap_or(DEFAULT_SCAN_PATH);
        let root = normalize(raw, &self.base_dir, &self.home);
        let max_depth = params
            .get("max_depth")
            .and_then(|v| v.as_u64())
            .unwrap_or(2)
            .clamp(1, 6) as usize;
        let since = (Utc::now() - ChronoDuration::days(RECENT_DAYS))
            .format("%Y-%m-%d")
            .to_string();

        if !root.is_dir() {
            tracing::info!("scan_directory: {} does not exist", root.display());
            return Ok(object(json!({
                "root": root.to_string_lossy(),
                "repos": [],
                "since": since,
                "error": format!("Path does not exist: {}", root.display()),
            })));
        }

        let scan_root = root.clone();
        let repos = tokio::task::spawn_blocking(move || scan_repos(&scan_root, max_depth))
            .await
            .map_err(|e| format!("scan task failed: {}", e))?;

        Ok(object(json!({
            "root": root.to_string_lossy(),
            "repos": repos,
            "since": since,
        })))
    }
}

/// 由上一步扫描结果生成 Markdown 周报；给了 `output_dir` 则同时落盘
pub struct GenerateReport {
    base_dir: PathBuf,
    home: PathBuf,
}

impl GenerateReport {
    pub fn new(base_dir: &Path) -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.to_path_buf());
        Self {
            base_dir: base_dir.to_path_buf(),
            home,
        }
    }
}

fn render_report(scan: &ActionOutput) -> String {
    let since = str_param(scan, "since").unwrap_or("N/A");
    let mut lines = vec![
        "# Weekly Dev Report".to_string(),
        format!("**Period**: {} -> {}", since, Utc::now().format("%Y-%m-%d")),
        String::new(),
    ];

    let repos = scan.get("repos").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    if repos.is_empty() {
        lines.push("_No repositories found._".to_string());
    }
    for repo in &repos {
        let name = repo.get("repo").and_then(|v| v.as_str()).unwrap_or("?");
        lines.push(format!("## {}", name));
        let recent: Vec<&str> = repo
            .get("recent_changes")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        if recent.is_empty() {
            lines.push("  _No changes this week._".to_string());
        } else {
            for file in recent {
                lines.push(format!("  - {}", file));
            }
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

#[async_trait]
impl ActionHandler for GenerateReport {
    fn name(&self) -> &str {
        "generate_report"
    }

    fn description(&self) -> &str {
        "Build a Markdown report from the previous scan_directory output. Params: {\"format\": string, \"output_dir\": string}"
    }

    async fn handle(
        &self,
        params: Map<String, Value>,
        previous_output: ActionOutput,
    ) -> Result<ActionOutput, String> {
        let format = str_param(&params, "format").unwrap_or("markdown").to_string();
        let report_text = render_report(&previous_output);

        let report_path = match str_param(&params, "output_dir") {
            Some(dir) => {
                let dir = normalize(dir, &self.base_dir, &self.home);
                let file = dir.join(format!("weekly_report_{}.md", Utc::now().format("%Y%m%d")));
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| format!("create {}: {}", dir.display(), e))?;
                tokio::fs::write(&file, &report_text)
                    .await
                    .map_err(|e| format!("write {}: {}", file.display(), e))?;
                tracing::info!("Report written to {}", file.display());
                Value::String(file.to_string_lossy().to_string())
            }
            None => Value::Null,
        };

        Ok(object(json!({
            "report_text": report_text,
            "report_path": report_path,
            "format": format,
        })))
    }
}

/// 外发占位：只记录意图，从不真正发送
pub struct PostSummary;

#[async_trait]
impl ActionHandler for PostSummary {
    fn name(&self) -> &str {
        "post_summary"
    }

    fn description(&self) -> &str {
        "Prepare a summary for an external target (slack/email); never actually posts"
    }

    async fn handle(
        &self,
        params: Map<String, Value>,
        previous_output: ActionOutput,
    ) -> Result<ActionOutput, String> {
        let target = str_param(&params, "target").unwrap_or("slack").to_string();
        let summary = truncate_chars(
            str_param(&previous_output, "report_text").unwrap_or(""),
            POST_SUMMARY_CHARS,
        );
        tracing::info!(target = %target, summary_len = summary.len(), "post_summary (not sent)");
        Ok(object(json!({
            "target": target,
            "posted": false,
            "summary": summary,
            "message": format!("Summary ready for {} (integration not configured).", target),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(v: Value) -> Map<String, Value> {
        object(v)
    }

    #[tokio::test]
    async fn test_summarise_text_truncates() {
        let long = "x".repeat(500);
        let out = SummariseText
            .handle(params(json!({ "text": long })), Map::new())
            .await
            .unwrap();
        assert_eq!(out["summary"].as_str().unwrap().len(), SUMMARY_CHARS);
        assert_eq!(out["chars"], json!(500));

        assert!(SummariseText.handle(Map::new(), Map::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_scan_finds_git_repos() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("alpha");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::fs::write(repo.join("main.rs"), "fn main() {}").unwrap();
        std::fs::create_dir_all(dir.path().join("not_a_repo")).unwrap();

        let scan = ScanDirectory::new(dir.path());
        let out = scan
            .handle(params(json!({"path": "."})), Map::new())
            .await
            .unwrap();
        let repos = out["repos"].as_array().unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0]["repo"], json!("alpha"));
        assert_eq!(repos[0]["files"], json!(1));
        assert_eq!(repos[0]["recent_changes"], json!(["main.rs"]));
    }

    #[tokio::test]
    async fn test_scan_missing_path_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let scan = ScanDirectory::new(dir.path());
        let out = scan
            .handle(params(json!({"path": "./missing"})), Map::new())
            .await
            .unwrap();
        assert!(out.contains_key("error"));
        assert_eq!(out["repos"], json!([]));
    }

    #[tokio::test]
    async fn test_report_chains_from_scan_and_post() {
        let dir = tempfile::tempdir().unwrap();
        let scan_output = params(json!({
            "since": "2026-01-01",
            "repos": [{"repo": "alpha", "recent_changes": ["src/lib.rs"]}]
        }));
        let report = GenerateReport::new(dir.path())
            .handle(params(json!({"output_dir": "./reports"})), scan_output)
            .await
            .unwrap();
        let text = report["report_text"].as_str().unwrap();
        assert!(text.starts_with("# Weekly Dev Report"));
        assert!(text.contains("## alpha"));
        assert!(text.contains("  - src/lib.rs"));
        let path = report["report_path"].as_str().unwrap();
        assert!(Path::new(path).exists());

        let posted = PostSummary
            .handle(params(json!({"target": "email"})), report)
            .await
            .unwrap();
        assert_eq!(posted["posted"], json!(false));
        assert_eq!(posted["target"], json!("email"));
        assert!(posted["summary"].as_str().unwrap().starts_with("# Weekly"));
    }
}
