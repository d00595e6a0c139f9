use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use reqwest::{redirect, Client};
use tracing::{debug, warn};

use crate::cli::config::HttpSettings;
use crate::engine::executor::{ScrapeExecutor, ScrapeOutcome, ScrapeRequest, StoredCookie};
use crate::error::ExecutionError;
use crate::fetch::extract::{compile_selector, extract_records};
use crate::storage::cookies::FileCookieStore;

/// Executor that fetches pages over HTTP and extracts records from the HTML
pub struct HttpExecutor {
    settings: HttpSettings,
}

impl HttpExecutor {
    pub fn new(settings: HttpSettings) -> Self {
        Self { settings }
    }

    fn build_client(&self, request: &ScrapeRequest) -> Result<Client, ExecutionError> {
        let params = &request.params;
        let user_agent = params
            .user_agent
            .clone()
            .unwrap_or_else(|| self.settings.user_agent.clone());

        let mut builder = Client::builder()
            .timeout(Duration::from_secs(u64::from(params.timeout_seconds)))
            .connect_timeout(Duration::from_secs(self.settings.connect_timeout_seconds))
            .redirect(redirect::Policy::limited(self.settings.max_redirects))
            .user_agent(user_agent)
            .default_headers(build_headers(request)?);

        if let Some(proxy) = &params.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|_| ExecutionError::Proxy(proxy.clone()))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| ExecutionError::Other(format!("failed to create HTTP client: {}", e)))
    }
}

fn build_headers(request: &ScrapeRequest) -> Result<HeaderMap, ExecutionError> {
    let mut headers = HeaderMap::new();

    for (name, value) in &request.params.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ExecutionError::Other(format!("invalid header name {:?}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| ExecutionError::Other(format!("invalid value for header {}", name)))?;
        headers.insert(name, value);
    }

    // Stored cookies are replayed unless the task sets its own Cookie header
    if !headers.contains_key(COOKIE) && request.cookie_ref.is_file() {
        match FileCookieStore::read_jar(&request.cookie_ref) {
            Ok(jar) if !jar.is_empty() => {
                let cookie_line = jar
                    .iter()
                    .map(|c| format!("{}={}", c.name, c.value))
                    .collect::<Vec<_>>()
                    .join("; ");
                if let Ok(value) = HeaderValue::from_str(&cookie_line) {
                    headers.insert(COOKIE, value);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Ignoring cookie jar {}: {}", request.cookie_ref.display(), e),
        }
    }

    Ok(headers)
}

#[async_trait]
impl ScrapeExecutor for HttpExecutor {
    async fn execute(&self, request: &ScrapeRequest) -> Result<ScrapeOutcome, ExecutionError> {
        // Fail on a bad selector before touching the network
        compile_selector(&request.selector, request.method)?;
        let client = self.build_client(request)?;

        debug!("Fetching {}", request.url);
        let response = client.get(&request.url).send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutionError::Timeout(request.params.timeout_seconds)
            } else {
                ExecutionError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExecutionError::HttpStatus(status.as_u16()));
        }

        let cookies: Vec<StoredCookie> = response
            .cookies()
            .map(|c| StoredCookie {
                name: c.name().to_string(),
                value: c.value().to_string(),
                domain: c.domain().map(str::to_string),
                path: c.path().map(str::to_string),
            })
            .collect();
        let final_url = response.url().clone();

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ExecutionError::Timeout(request.params.timeout_seconds)
            } else {
                ExecutionError::Network(e.to_string())
            }
        })?;

        let selector = compile_selector(&request.selector, request.method)?;
        let records = extract_records(&body, &selector, Some(&final_url));
        debug!("Extracted {} records from {}", records.len(), final_url);

        Ok(ScrapeOutcome { records, cookies })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::task::{ScrapeMethod, TaskParams};
    use std::path::PathBuf;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HTML: &str = r#"<html><body>
        <ul id="links"><li><a href="/one">One</a></li><li><a href="/two">Two</a></li></ul>
    </body></html>"#;

    fn settings() -> HttpSettings {
        HttpSettings {
            user_agent: "TestBot/1.0".to_string(),
            connect_timeout_seconds: 5,
            max_redirects: 5,
        }
    }

    fn request(url: String, selector: &str, method: ScrapeMethod) -> ScrapeRequest {
        ScrapeRequest {
            url,
            selector: selector.to_string(),
            method,
            params: TaskParams::default(),
            cookie_ref: PathBuf::from("/nonexistent/cookies.json"),
        }
    }

    #[tokio::test]
    async fn test_fetch_and_extract() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header("user-agent", "TestBot/1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(HTML))
            .mount(&server)
            .await;

        let executor = HttpExecutor::new(settings());
        let outcome = executor
            .execute(&request(format!("{}/page", server.uri()), "#links a", ScrapeMethod::Css))
            .await
            .unwrap();

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.records[1].title.as_deref(), Some("Two"));
        assert_eq!(
            outcome.records[0].link.as_deref(),
            Some(format!("{}/one", server.uri()).as_str())
        );
    }

    #[tokio::test]
    async fn test_xpath_and_custom_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(header("x-token", "abc"))
            .and(header("user-agent", "Custom/2.0"))
            .respond_with(ResponseTemplate::new(200).set_body_string(HTML))
            .mount(&server)
            .await;

        let mut req = request(format!("{}/", server.uri()), "//ul[@id='links']//a", ScrapeMethod::XPath);
        req.params.headers.insert("X-Token".to_string(), "abc".to_string());
        req.params.user_agent = Some("Custom/2.0".to_string());

        let outcome = HttpExecutor::new(settings()).execute(&req).await.unwrap();
        assert_eq!(outcome.records.len(), 2);
    }

    #[tokio::test]
    async fn test_cookies_are_replayed_and_captured() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("jar.json");
        std::fs::write(&jar, r#"[{"name": "session", "value": "abc"}]"#).unwrap();

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("cookie", "session=abc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", "session=xyz; Path=/")
                    .set_body_string(HTML),
            )
            .mount(&server)
            .await;

        let mut req = request(server.uri(), "a", ScrapeMethod::Css);
        req.cookie_ref = jar;

        let outcome = HttpExecutor::new(settings()).execute(&req).await.unwrap();
        assert_eq!(outcome.cookies.len(), 1);
        assert_eq!(outcome.cookies[0].name, "session");
        assert_eq!(outcome.cookies[0].value, "xyz");
        assert_eq!(outcome.cookies[0].path.as_deref(), Some("/"));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = HttpExecutor::new(settings())
            .execute(&request(server.uri(), "a", ScrapeMethod::Css))
            .await;
        assert!(matches!(result, Err(ExecutionError::HttpStatus(503))));
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let mut req = request(server.uri(), "a", ScrapeMethod::Css);
        req.params.timeout_seconds = 1;

        let result = HttpExecutor::new(settings()).execute(&req).await;
        assert!(matches!(result, Err(ExecutionError::Timeout(1))));
    }

    #[tokio::test]
    async fn test_invalid_selector_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let result = HttpExecutor::new(settings())
            .execute(&request(server.uri(), "div[", ScrapeMethod::Css))
            .await;
        assert!(matches!(result, Err(ExecutionError::InvalidSelector { .. })));
    }

    #[tokio::test]
    async fn test_invalid_proxy() {
        let mut req = request("http://127.0.0.1:9".to_string(), "a", ScrapeMethod::Css);
        req.params.proxy = Some("::not a proxy::".to_string());

        let result = HttpExecutor::new(settings()).execute(&req).await;
        assert!(matches!(result, Err(ExecutionError::Proxy(_))));
    }
}
