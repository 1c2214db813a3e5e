use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Local, TimeZone};
use log::{debug, warn};
use reqwest::header::{ACCEPT_LANGUAGE, AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::file_logger::{LogEntry, LogSink};
use crate::models::{
    AppConfig, KeySlotConfig, LimitInfo, ModelUsageApiResponse, QuotaApiResponse,
    QuotaApiResponseFull, QuotaSnapshot, SlotStats, ToolUsageApiResponse, ToolUsageTotals,
    UsageDetailInfo, UsageWindow,
};

/// Hosts that debug mode redirects to the mock base URL.
const KNOWN_PROVIDER_HOSTS: [&str; 2] = ["api.z.ai", "open.bigmodel.cn"];

const CONNECT_TIMEOUT_SECS: u64 = 5;
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error("api code {0}")]
    Api(i64),
    #[error("invalid response: {0}")]
    Parse(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// The slice of the provider API the scheduler tasks consume. Split out as
/// a trait so tests can script responses without a network.
#[async_trait]
pub trait QuotaApi: Send + Sync {
    async fn fetch_quota(&self, cfg: &KeySlotConfig) -> ApiResult<QuotaSnapshot>;

    /// Returns `(total_calls, total_tokens)` for the window; missing totals
    /// come back as 0.
    async fn fetch_model_usage(
        &self,
        cfg: &KeySlotConfig,
        window: UsageWindow,
    ) -> ApiResult<(u64, u64)>;

    /// A 2xx here only means the gateway accepted the call; whether the
    /// quota timer advanced is confirmed by the next quota poll.
    async fn send_wake(&self, cfg: &KeySlotConfig) -> ApiResult<()>;
}

pub struct ApiClient {
    client: reqwest::Client,
    mock_base: Option<String>,
    sink: Arc<dyn LogSink>,
}

impl ApiClient {
    pub fn new(mock_base: Option<String>, sink: Arc<dyn LogSink>) -> ApiResult<Self> {
        let accept_invalid_certs = mock_base.as_deref().map_or(false, is_loopback_url);
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|err| ApiError::Network(format!("failed to create HTTP client: {err}")))?;

        Ok(Self {
            client,
            mock_base,
            sink,
        })
    }

    pub fn from_config(config: &AppConfig, sink: Arc<dyn LogSink>) -> ApiResult<Self> {
        let mock_base = if config.debug {
            config.mock_url.clone()
        } else {
            None
        };
        Self::new(mock_base, sink)
    }

    fn auth_header(api_key: &str) -> String {
        if api_key.trim_start().starts_with("Bearer ") {
            api_key.trim().to_string()
        } else {
            format!("Bearer {}", api_key.trim())
        }
    }

    /// Rewrites scheme+host to the mock base for known provider hosts,
    /// preserving path and query. No-op outside debug mode.
    fn effective_url(&self, url: &str) -> String {
        let Some(base) = &self.mock_base else {
            return url.to_string();
        };
        let Ok(parsed) = reqwest::Url::parse(url) else {
            return url.to_string();
        };
        let known = parsed
            .host_str()
            .map_or(false, |host| KNOWN_PROVIDER_HOSTS.contains(&host));
        if !known {
            return url.to_string();
        }

        let mut rewritten = base.trim_end_matches('/').to_string();
        rewritten.push_str(parsed.path());
        if let Some(query) = parsed.query() {
            rewritten.push('?');
            rewritten.push_str(query);
        }
        rewritten
    }

    async fn log_wire(&self, logging: bool, entry: LogEntry) {
        if logging {
            self.sink.append(entry).await;
        }
    }

    /// Shared GET path: headers, transport/status mapping, wire logging.
    async fn get_text(&self, cfg: &KeySlotConfig, action: &str, url: &str) -> ApiResult<String> {
        let flow_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        self.log_wire(
            cfg.logging,
            LogEntry::request(
                cfg.slot,
                action,
                &flow_id,
                json!({ "method": "GET", "url": url }),
            ),
        )
        .await;

        let result = self
            .client
            .get(url)
            .header(AUTHORIZATION, Self::auth_header(&cfg.api_key))
            .header(ACCEPT_LANGUAGE, "en-US")
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                let elapsed = started.elapsed().as_millis() as u64;
                self.log_wire(
                    cfg.logging,
                    LogEntry::error(cfg.slot, action, &flow_id, elapsed, &err.to_string()),
                )
                .await;
                return Err(ApiError::Network(err.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let elapsed = started.elapsed().as_millis() as u64;
            self.log_wire(
                cfg.logging,
                LogEntry::error(
                    cfg.slot,
                    action,
                    &flow_id,
                    elapsed,
                    &format!("http status {status}"),
                ),
            )
            .await;
            return Err(ApiError::HttpStatus(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|err| ApiError::Network(err.to_string()))?;

        let elapsed = started.elapsed().as_millis() as u64;
        let body_value = serde_json::from_str::<serde_json::Value>(&body)
            .unwrap_or_else(|_| serde_json::Value::String(body.clone()));
        self.log_wire(
            cfg.logging,
            LogEntry::response(
                cfg.slot,
                action,
                &flow_id,
                elapsed,
                json!({ "status": status.as_u16(), "body": body_value }),
            ),
        )
        .await;

        Ok(body)
    }

    /// Malformed envelopes get logged with the raw body before the error
    /// propagates.
    async fn parse_envelope<T: serde::de::DeserializeOwned>(
        &self,
        cfg: &KeySlotConfig,
        action: &str,
        body: &str,
    ) -> ApiResult<T> {
        match serde_json::from_str::<T>(body) {
            Ok(parsed) => Ok(parsed),
            Err(err) => {
                let mut entry = LogEntry::error(cfg.slot, action, "-", 0, &err.to_string());
                entry.details =
                    Some(json!({ "error": err.to_string(), "raw_body": body }));
                self.log_wire(cfg.logging, entry).await;
                Err(ApiError::Parse(err.to_string()))
            }
        }
    }

    fn usage_base(quota_url: &str) -> &str {
        quota_url.trim_end_matches("/quota/limit")
    }

    fn usage_window_query(window: UsageWindow) -> String {
        let now = Local::now();
        let start = (now - chrono::Duration::hours(window.hours()))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let end = now.format("%Y-%m-%d %H:%M:%S").to_string();
        format!(
            "startTime={}&endTime={}",
            urlencoding::encode(&start),
            urlencoding::encode(&end)
        )
    }

    pub async fn fetch_tool_usage(
        &self,
        cfg: &KeySlotConfig,
        window: UsageWindow,
    ) -> ApiResult<ToolUsageTotals> {
        let url = format!(
            "{}/tool-usage?{}",
            Self::usage_base(&cfg.quota_url),
            Self::usage_window_query(window)
        );
        let url = self.effective_url(&url);
        let body = self.get_text(cfg, "fetch_tool_usage", &url).await?;
        let parsed: ToolUsageApiResponse = self.parse_envelope(cfg, "fetch_tool_usage", &body).await?;

        if parsed.code != 200 {
            return Err(ApiError::Api(parsed.code));
        }

        Ok(parsed
            .data
            .and_then(|data| data.total_usage)
            .unwrap_or(ToolUsageTotals {
                total_network_search_count: 0,
                total_web_read_mcp_count: 0,
                total_zread_mcp_count: 0,
                total_search_mcp_count: 0,
            }))
    }

    /// Manual, on-demand stats for one slot: full limits list plus 24h
    /// model and tool usage. Usage endpoints are best effort.
    pub async fn fetch_slot_stats(&self, cfg: &KeySlotConfig) -> ApiResult<SlotStats> {
        let url = self.effective_url(&cfg.quota_url);
        let body = self.get_text(cfg, "fetch_slot_stats", &url).await?;
        let parsed: QuotaApiResponseFull = self.parse_envelope(cfg, "fetch_slot_stats", &body).await?;

        if parsed.code != 200 {
            return Err(ApiError::Api(parsed.code));
        }

        let data = parsed
            .data
            .ok_or_else(|| ApiError::Parse("quota response missing data".to_string()))?;
        let level = data.level.unwrap_or_else(|| "unknown".into());

        let limits: Vec<LimitInfo> = data
            .limits
            .iter()
            .map(|limit| {
                let hms = limit.next_reset_time.and_then(|ts| {
                    if ts > 0 {
                        Local
                            .timestamp_millis_opt(ts)
                            .single()
                            .map(|dt| dt.format("%H:%M:%S").to_string())
                    } else {
                        None
                    }
                });
                LimitInfo {
                    type_name: limit.r#type.clone(),
                    percentage: limit.percentage,
                    usage: limit.usage,
                    current_value: limit.current_value,
                    remaining: limit.remaining,
                    next_reset_time: limit.next_reset_time,
                    next_reset_hms: hms,
                    usage_details: limit
                        .usage_details
                        .iter()
                        .map(|detail| UsageDetailInfo {
                            model_code: detail.model_code.clone(),
                            usage: detail.usage,
                        })
                        .collect(),
                }
            })
            .collect();

        let (total_model_calls, total_tokens) = match self
            .fetch_model_usage(cfg, UsageWindow::TwentyFourHours)
            .await
        {
            Ok(totals) => totals,
            Err(err) => {
                debug!("slot {}: model-usage fetch failed: {err}", cfg.slot);
                (0, 0)
            }
        };

        let tools = match self.fetch_tool_usage(cfg, UsageWindow::TwentyFourHours).await {
            Ok(totals) => totals,
            Err(err) => {
                debug!("slot {}: tool-usage fetch failed: {err}", cfg.slot);
                ToolUsageTotals {
                    total_network_search_count: 0,
                    total_web_read_mcp_count: 0,
                    total_zread_mcp_count: 0,
                    total_search_mcp_count: 0,
                }
            }
        };

        Ok(SlotStats {
            level,
            limits,
            total_model_calls_24h: total_model_calls,
            total_tokens_24h: total_tokens,
            total_network_search_24h: tools.total_network_search_count,
            total_web_read_24h: tools.total_web_read_mcp_count,
            total_zread_24h: tools.total_zread_mcp_count,
            total_search_mcp_24h: tools.total_search_mcp_count,
        })
    }
}

#[async_trait]
impl QuotaApi for ApiClient {
    async fn fetch_quota(&self, cfg: &KeySlotConfig) -> ApiResult<QuotaSnapshot> {
        let url = self.effective_url(&cfg.quota_url);
        let body = self.get_text(cfg, "fetch_quota", &url).await?;
        let payload: QuotaApiResponse = self.parse_envelope(cfg, "fetch_quota", &body).await?;

        if payload.code != 200 {
            return Err(ApiError::Api(payload.code));
        }

        let limits = payload
            .data
            .ok_or_else(|| ApiError::Parse("quota response missing data".to_string()))?
            .limits;

        let tokens_limit = limits.iter().find(|limit| limit.r#type == "TOKENS_LIMIT");
        let selected = tokens_limit
            .or_else(|| limits.first())
            .ok_or_else(|| ApiError::Parse("quota limits missing".to_string()))?;

        let cold_key = tokens_limit.map_or(false, |limit| limit.next_reset_time.is_none());
        let timer_active = selected.next_reset_time.is_some();

        let (hms, epoch) = match selected.next_reset_time {
            Some(ts) if ts > 0 => {
                let hms = Local
                    .timestamp_millis_opt(ts)
                    .single()
                    .map(|dt| dt.format("%H:%M:%S").to_string());
                (hms, Some(ts))
            }
            _ => (None, None),
        };

        debug!(
            "slot {}: quota={}%, timer_active={}, reset={}",
            cfg.slot,
            selected.percentage,
            timer_active,
            hms.as_deref().unwrap_or("none")
        );

        Ok(QuotaSnapshot {
            percentage: selected.percentage,
            timer_active,
            cold_key,
            next_reset_hms: hms,
            next_reset_epoch_ms: epoch,
        })
    }

    async fn fetch_model_usage(
        &self,
        cfg: &KeySlotConfig,
        window: UsageWindow,
    ) -> ApiResult<(u64, u64)> {
        let url = format!(
            "{}/model-usage?{}",
            Self::usage_base(&cfg.quota_url),
            Self::usage_window_query(window)
        );
        let url = self.effective_url(&url);
        let body = self.get_text(cfg, "fetch_model_usage", &url).await?;
        let parsed: ModelUsageApiResponse =
            self.parse_envelope(cfg, "fetch_model_usage", &body).await?;

        if parsed.code != 200 {
            return Err(ApiError::Api(parsed.code));
        }

        let totals = parsed.data.and_then(|data| data.total_usage);
        Ok((
            totals.as_ref().map_or(0, |t| t.total_model_call_count),
            totals.as_ref().map_or(0, |t| t.total_tokens_usage),
        ))
    }

    async fn send_wake(&self, cfg: &KeySlotConfig) -> ApiResult<()> {
        let Some(url) = cfg.request_url.clone() else {
            return Err(ApiError::Network("no request URL configured".to_string()));
        };
        let url = self.effective_url(&url);

        let body = json!({
            "model": "glm-4-flash",
            "messages": [{ "role": "user", "content": "hi" }],
            "max_tokens": 1
        });

        let flow_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        self.log_wire(
            cfg.logging,
            LogEntry::request(
                cfg.slot,
                "send_wake",
                &flow_id,
                json!({ "method": "POST", "url": url, "body": body }),
            ),
        )
        .await;

        let result = self
            .client
            .post(&url)
            .header(AUTHORIZATION, Self::auth_header(&cfg.api_key))
            .header(ACCEPT_LANGUAGE, "en-US")
            .header(CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await;

        let elapsed = started.elapsed().as_millis() as u64;
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!("slot {}: wake request failed: {err}", cfg.slot);
                self.log_wire(
                    cfg.logging,
                    LogEntry::error(cfg.slot, "send_wake", &flow_id, elapsed, &err.to_string()),
                )
                .await;
                return Err(ApiError::Network(err.to_string()));
            }
        };

        let status = response.status();
        // Response body skipped for the completion endpoint.
        self.log_wire(
            cfg.logging,
            LogEntry::response(
                cfg.slot,
                "send_wake",
                &flow_id,
                elapsed,
                json!({ "status": status.as_u16() }),
            ),
        )
        .await;

        if !status.is_success() {
            return Err(ApiError::HttpStatus(status.as_u16()));
        }

        Ok(())
    }
}

fn is_loopback_url(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    match parsed.host_str() {
        Some("localhost") | Some("127.0.0.1") | Some("[::1]") | Some("::1") => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_logger::NullSink;

    fn client_with_mock(mock: &str) -> ApiClient {
        ApiClient::new(Some(mock.to_string()), Arc::new(NullSink)).unwrap()
    }

    #[test]
    fn auth_header_adds_bearer_prefix_once() {
        assert_eq!(ApiClient::auth_header("abc"), "Bearer abc");
        assert_eq!(ApiClient::auth_header("Bearer abc"), "Bearer abc");
        assert_eq!(ApiClient::auth_header("  Bearer abc  "), "Bearer abc");
    }

    #[test]
    fn effective_url_rewrites_known_hosts_only() {
        let client = client_with_mock("http://127.0.0.1:9000");
        assert_eq!(
            client.effective_url("https://api.z.ai/api/monitor/usage/quota/limit"),
            "http://127.0.0.1:9000/api/monitor/usage/quota/limit"
        );
        assert_eq!(
            client.effective_url("https://open.bigmodel.cn/api/monitor/usage/model-usage?startTime=a&endTime=b"),
            "http://127.0.0.1:9000/api/monitor/usage/model-usage?startTime=a&endTime=b"
        );
        assert_eq!(
            client.effective_url("https://example.com/other"),
            "https://example.com/other"
        );
    }

    #[test]
    fn effective_url_is_identity_without_mock_base() {
        let client = ApiClient::new(None, Arc::new(NullSink)).unwrap();
        let url = "https://api.z.ai/api/monitor/usage/quota/limit";
        assert_eq!(client.effective_url(url), url);
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_url("http://127.0.0.1:8080"));
        assert!(is_loopback_url("http://localhost:1234"));
        assert!(!is_loopback_url("https://api.z.ai"));
        assert!(!is_loopback_url("not a url"));
    }
}
