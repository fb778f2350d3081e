//! Best-effort employer context for the review prompt.
//!
//! Two sources are tried in order: the report service at
//! `<enrichment_url>/resume/review`, then a free-form completion asking for
//! an employer profile. Nothing here can fail a review; every failure is
//! logged and the prompt simply goes without employer context.
//!
//! Both sources are network calls and honour the caller's deadline: an
//! expired deadline skips them, a running call is abandoned when it passes.

use crate::completion::CompletionClient;
use crate::config::ReviewConfig;
use crate::error::{CompletionError, StageError};
use crate::prompts::employer_profile_prompt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
struct ReportRequest<'a> {
    resume_text: &'a str,
    company_name: &'a str,
    job_title: &'a str,
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    #[serde(default)]
    report: String,
}

/// Employer context and, when every source failed, why.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enrichment {
    pub context: String,
    pub error: Option<StageError>,
}

/// Look up employer context for `company_name`.
///
/// A blank company name skips enrichment entirely.
pub async fn employer_context(
    resume_text: &str,
    company_name: &str,
    job_title: &str,
    config: &ReviewConfig,
    completion: Option<&dyn CompletionClient>,
    deadline: Option<Instant>,
) -> Enrichment {
    let company_name = company_name.trim();
    if company_name.is_empty() {
        return Enrichment::default();
    }

    let mut failures = Vec::new();

    if let Some(base) = config
        .enrichment_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
    {
        let request = ReportRequest {
            resume_text,
            company_name,
            job_title: job_title.trim(),
        };
        let fetch = fetch_report(base, &request, config.enrichment_timeout_secs);
        match before_deadline(deadline, fetch).await {
            Ok(report) => {
                info!(
                    "Employer context for '{}' from report service ({} chars)",
                    company_name,
                    report.len()
                );
                return Enrichment {
                    context: report,
                    error: None,
                };
            }
            Err(e) => {
                warn!("Report service failed for '{}': {}", company_name, e);
                failures.push(format!("report service: {e}"));
            }
        }
    }

    match completion {
        Some(client) => {
            let prompt = employer_profile_prompt(company_name);
            let call = async { client.complete_text(&prompt).await.map_err(|e| e.to_string()) };
            match before_deadline(deadline, call).await {
                Ok(profile) if !profile.trim().is_empty() => {
                    info!(
                        "Employer context for '{}' from completion ({} chars)",
                        company_name,
                        profile.len()
                    );
                    return Enrichment {
                        context: profile.trim().to_string(),
                        error: None,
                    };
                }
                Ok(_) => failures.push("completion: empty profile".to_string()),
                Err(e) => {
                    warn!("Employer profile completion failed for '{}': {}", company_name, e);
                    failures.push(format!("completion: {e}"));
                }
            }
        }
        None => debug!("No completion client, skipping employer profile"),
    }

    Enrichment {
        context: String::new(),
        error: (!failures.is_empty()).then(|| StageError::EnrichmentFailed {
            detail: failures.join("; "),
        }),
    }
}

/// Run `call` unless `deadline` has passed, abandoning it when it does.
async fn before_deadline<T, F>(deadline: Option<Instant>, call: F) -> Result<T, String>
where
    F: Future<Output = Result<T, String>>,
{
    let exceeded = || CompletionError::DeadlineExceeded.to_string();
    match deadline {
        Some(at) if Instant::now() >= at => Err(exceeded()),
        Some(at) => tokio::time::timeout_at(at, call)
            .await
            .unwrap_or_else(|_| Err(exceeded())),
        None => call.await,
    }
}

async fn fetch_report(
    base_url: &str,
    request: &ReportRequest<'_>,
    timeout_secs: u64,
) -> Result<String, String> {
    let url = format!("{}/resume/review", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| e.to_string())?;

    let response = client
        .post(&url)
        .json(request)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                format!("timed out after {timeout_secs}s")
            } else {
                e.to_string()
            }
        })?;

    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }

    let body: ReportResponse = response.json().await.map_err(|e| e.to_string())?;
    let report = body.report.trim();
    if report.is_empty() {
        return Err("empty report".into());
    }
    Ok(report.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::testing::ScriptedCompletion;
    use crate::error::CompletionError;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the request it received.
    async fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if received.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn blank_company_skips_everything() {
        let client = ScriptedCompletion::default();
        let config = ReviewConfig::default();
        let out = employer_context("text", "  ", "", &config, Some(&client), None).await;
        assert_eq!(out, Enrichment::default());
        assert!(client.text_prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn report_service_is_preferred() {
        let (url, server) = serve_once("200 OK", r#"{"report":"Acme values ownership"}"#).await;
        let config = ReviewConfig::builder().enrichment_url(url).build().unwrap();
        let client = ScriptedCompletion::default();

        let out =
            employer_context("I led a team", "Acme", "Engineer", &config, Some(&client), None)
                .await;
        assert_eq!(out.context, "Acme values ownership");
        assert!(out.error.is_none());
        assert!(client.text_prompts.lock().unwrap().is_empty());

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /resume/review"));
        assert!(request.contains(r#""company_name":"Acme""#));
        assert!(request.contains(r#""resume_text":"I led a team""#));
    }

    #[tokio::test]
    async fn failed_report_falls_back_to_completion() {
        let (url, _server) = serve_once("500 Internal Server Error", "{}").await;
        let config = ReviewConfig::builder().enrichment_url(url).build().unwrap();
        let client = ScriptedCompletion::default();
        client.push_text(Ok(r#"{"summary":"Acme builds robots"}"#.into()));

        let out = employer_context("text", "Acme", "", &config, Some(&client), None).await;
        assert!(out.context.contains("Acme builds robots"));
        assert!(out.error.is_none());
        assert!(client.text_prompts.lock().unwrap()[0].starts_with("Company: Acme"));
    }

    #[tokio::test]
    async fn total_failure_is_swallowed_and_recorded() {
        let client = ScriptedCompletion::default();
        client.push_text(Err(CompletionError::Timeout(60)));
        let config = ReviewConfig::default();
        let out = employer_context("text", "Acme", "", &config, Some(&client), None).await;
        assert!(out.context.is_empty());
        assert!(matches!(out.error, Some(StageError::EnrichmentFailed { .. })));
    }

    #[tokio::test]
    async fn no_sources_is_silent() {
        let out = employer_context("text", "Acme", "", &ReviewConfig::default(), None, None).await;
        assert_eq!(out, Enrichment::default());
    }

    /// Completion that takes `delay` to answer.
    struct SlowCompletion {
        delay: Duration,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl CompletionClient for SlowCompletion {
        async fn complete_json(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _temperature: f32,
            _max_tokens: usize,
        ) -> Result<String, CompletionError> {
            Err(CompletionError::Empty)
        }

        async fn complete_text(&self, _prompt: &str) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok("Acme builds robots".into())
        }
    }

    #[tokio::test]
    async fn expired_deadline_skips_both_sources() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ReviewConfig::builder()
            .enrichment_url(format!("http://{}", listener.local_addr().unwrap()))
            .build()
            .unwrap();
        let client = ScriptedCompletion::default();
        client.push_text(Ok("Acme builds robots".into()));

        let out =
            employer_context("text", "Acme", "", &config, Some(&client), Some(Instant::now()))
                .await;
        assert!(out.context.is_empty());
        assert!(client.text_prompts.lock().unwrap().is_empty());
        let Some(StageError::EnrichmentFailed { detail }) = out.error else {
            panic!("expected an enrichment failure");
        };
        assert!(detail.contains("report service: Review deadline exceeded"));
        assert!(detail.contains("completion: Review deadline exceeded"));
        // the report service never saw a connection
        let accepted =
            tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn slow_completion_is_abandoned_at_deadline() {
        let client = SlowCompletion {
            delay: Duration::from_secs(5),
            calls: Default::default(),
        };
        let started = Instant::now();
        let deadline = started + Duration::from_millis(100);

        let config = ReviewConfig::default();
        let out =
            employer_context("text", "Acme", "", &config, Some(&client), Some(deadline)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(client.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(out.context.is_empty());
        assert!(matches!(out.error, Some(StageError::EnrichmentFailed { .. })));
    }

    #[tokio::test]
    async fn silent_report_service_is_abandoned_at_deadline() {
        // accepts the connection but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });
        let config = ReviewConfig::builder()
            .enrichment_url(format!("http://{addr}"))
            .build()
            .unwrap();
        let started = Instant::now();
        let deadline = started + Duration::from_millis(150);

        let out = employer_context("text", "Acme", "", &config, None, Some(deadline)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        let Some(StageError::EnrichmentFailed { detail }) = out.error else {
            panic!("expected an enrichment failure");
        };
        assert!(detail.contains("deadline exceeded"));
    }
}
