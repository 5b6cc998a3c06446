//! Browser 工具：使用 Headless Chrome 访问页面并提取可读文本
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。headless_chrome 为同步 API，
//! 所有浏览器操作都放进 spawn_blocking，避免阻塞 Agent 的步循环。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use headless_chrome::Browser;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{schema_of, Tool, ToolResult};

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct BrowserArgs {
    /// 要访问的 URL（域名需在白名单内）
    url: String,
    /// 可选 CSS 选择器；省略时提取整个 body
    selector: Option<String>,
}

/// 从 URL 提取域名（小写）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let host = url.split('/').next()?;
    let host = host.split(':').next()?;
    Some(host.to_lowercase())
}

/// Browser 工具：访问 URL、等待渲染后提取文本
pub struct BrowserTool {
    allowed_domains: HashSet<String>,
    max_result_chars: usize,
    browser: Arc<Mutex<Option<Browser>>>,
}

impl BrowserTool {
    pub fn new(allowed_domains: Vec<String>, max_result_chars: usize) -> Self {
        Self {
            allowed_domains: allowed_domains.into_iter().map(|s| s.to_lowercase()).collect(),
            max_result_chars,
            browser: Arc::new(Mutex::new(None)),
        }
    }

    fn is_allowed(&self, url: &str) -> Result<(), String> {
        let domain = extract_domain(url).ok_or_else(|| "Invalid or missing URL".to_string())?;
        if self.allowed_domains.contains(&domain) {
            return Ok(());
        }
        Err(format!("Domain not in allowlist: {}", domain))
    }
}

#[async_trait]
impl Tool for BrowserTool {
    fn name(&self) -> &str {
        "browser"
    }

    fn description(&self) -> &str {
        "Open a web page in a headless browser and return its rendered text. Args: {\"url\": \"https://...\", \"selector\": \"optional css\"}"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<BrowserArgs>()
    }

    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let args: BrowserArgs = serde_json::from_value(args).map_err(|e| e.to_string())?;
        self.is_allowed(&args.url)?;

        let browser_slot = Arc::clone(&self.browser);
        let max_chars = self.max_result_chars;
        let url = args.url.clone();
        tracing::info!(url = %url, selector = ?args.selector, "browser tool fetch");

        let text = tokio::task::spawn_blocking(move || {
            let mut guard = browser_slot.lock().map_err(|e| e.to_string())?;
            if guard.is_none() {
                let browser = Browser::default()
                    .map_err(|e| format!("Chrome launch failed: {}. Install Chrome/Chromium.", e))?;
                *guard = Some(browser);
            }
            let browser = guard
                .as_ref()
                .ok_or_else(|| "Browser unavailable".to_string())?;
            let tab = browser
                .new_tab()
                .map_err(|e| format!("Browser tab failed: {}", e))?;
            tab.navigate_to(&args.url)
                .map_err(|e| format!("Navigate failed: {}", e))?;
            let selector = args.selector.as_deref().unwrap_or("body");
            let element = tab
                .wait_for_element(selector)
                .map_err(|e| format!("Element not found: {}", e))?;
            let text = element
                .get_inner_text()
                .map_err(|e| format!("Get text failed: {}", e))?;
            let _ = tab.close(true);

            if text.chars().count() > max_chars {
                Ok::<_, String>(text.chars().take(max_chars).collect::<String>() + "\n...[truncated]")
            } else {
                Ok(text)
            }
        })
        .await
        .map_err(|e| format!("Task join: {}", e))??;

        Ok(ToolResult::json(serde_json::json!({ "url": url, "text": text })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://Docs.rs/tokio/latest"),
            Some("docs.rs".to_string())
        );
        assert_eq!(extract_domain("http://localhost:8080/x"), Some("localhost".to_string()));
        assert_eq!(extract_domain("ftp://x"), None);
    }

    #[tokio::test]
    async fn test_domain_allowlist_enforced_before_launch() {
        let tool = BrowserTool::new(vec!["docs.rs".to_string()], 1000);
        let err = tool
            .execute(serde_json::json!({"url": "https://evil.example/"}))
            .await
            .unwrap_err();
        assert!(err.contains("not in allowlist"));
    }
}
