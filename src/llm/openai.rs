use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::billing;
use crate::config::CONFIG;
use crate::db::Database;
use crate::llm::ChatTurn;
use crate::utils::http::http_client;

const MAX_COMPLETION_ATTEMPTS: u32 = 3;
const RATE_LIMIT_BACKOFF_SECS: u64 = 20;
const CHAT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const IMAGE_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const SHORT_PROMPT_THRESHOLD: usize = 20;

const QUALITY_TERMS: [&str; 6] = [
    "quality",
    "detailed",
    "4k",
    "hd",
    "высокое качество",
    "детализированное",
];

/// Model quality level selected by subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Standard,
    Premium,
}

impl ModelTier {
    pub fn for_subscription(subscribed: bool) -> Self {
        if subscribed {
            ModelTier::Premium
        } else {
            ModelTier::Standard
        }
    }

    fn model_id(self) -> &'static str {
        match self {
            ModelTier::Standard => &CONFIG.default_model,
            ModelTier::Premium => &CONFIG.premium_model,
        }
    }
}

/// Failure classes of the completion call. Callers match on the kind and
/// surface `user_message` instead of any transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("rate limited after {MAX_COMPLETION_ATTEMPTS} attempts")]
    RateLimited,
    #[error("connection or timeout failure")]
    Transient,
    #[error("completion request failed")]
    Generic,
}

impl CompletionError {
    pub fn user_message(self) -> &'static str {
        match self {
            CompletionError::RateLimited => {
                "Извини, сервер OpenAI сильно перегружен. Попробуй еще раз через пару минут."
            }
            CompletionError::Transient => {
                "Извини, возникла проблема с подключением к OpenAI. Попробуй еще раз чуть позже."
            }
            CompletionError::Generic => {
                "Извини, у меня возникла проблема с ответом. Попробуй еще раз через минуту."
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ImageError {
    #[error("image generation requires a subscription")]
    NotSubscribed,
    #[error("image generation rate limited")]
    RateLimited,
    #[error("image generation failed: {0}")]
    Failed(String),
}

impl ImageError {
    pub fn user_message(&self) -> String {
        match self {
            ImageError::NotSubscribed => {
                "Генерация изображений доступна только для пользователей с подпиской. Оформи подписку!"
                    .to_string()
            }
            ImageError::RateLimited => {
                "Превышен лимит запросов на генерацию изображений. Попробуй позже.".to_string()
            }
            ImageError::Failed(reason) => {
                format!("Ошибка при генерации изображения: {reason}")
            }
        }
    }
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

/// Ordered prompt: optional system directive, optional summary note, the
/// short-term window, then the new user message.
fn build_chat_messages(
    system_prompt: Option<&str>,
    summary: Option<&str>,
    window: &[ChatTurn],
    user_message: &str,
) -> Vec<Value> {
    let mut messages = Vec::with_capacity(window.len() + 3);
    if let Some(prompt) = system_prompt {
        messages.push(json!({ "role": "system", "content": prompt }));
    }
    if let Some(summary) = summary {
        messages.push(json!({ "role": "system", "content": format!("Summary: {summary}") }));
    }
    for turn in window {
        messages.push(json!({ "role": turn.role, "content": turn.content }));
    }
    messages.push(json!({ "role": "user", "content": user_message }));
    messages
}

fn classify_transport_error(err: &reqwest::Error) -> CompletionError {
    if err.is_timeout() || err.is_connect() {
        CompletionError::Transient
    } else {
        CompletionError::Generic
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(RATE_LIMIT_BACKOFF_SECS * u64::from(attempt))
}

/// Attempt(n) for n=1..=3: rate limit retries after a linear backoff,
/// every other failure is terminal on the first hit.
async fn retry_on_rate_limit<F, Fut>(mut call: F) -> Result<String, CompletionError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<String, CompletionError>>,
{
    let mut attempt = 1;
    loop {
        match call(attempt).await {
            Err(CompletionError::RateLimited) if attempt < MAX_COMPLETION_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                warn!(
                    "Chat completion rate limited on attempt {attempt}, retrying in {}s",
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn call_chat_api(payload: &Value) -> Result<String, CompletionError> {
    let response = http_client()
        .post(format!(
            "{}/chat/completions",
            CONFIG.openai_base_url.trim_end_matches('/')
        ))
        .bearer_auth(&CONFIG.openai_api_key)
        .timeout(CHAT_REQUEST_TIMEOUT)
        .json(payload)
        .send()
        .await
        .map_err(|err| {
            warn!("Chat completion transport error: {err}");
            classify_transport_error(&err)
        })?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(CompletionError::RateLimited);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(
            "Chat completion failed: status={status}, body={}",
            truncate_for_log(&body, 2000)
        );
        return Err(CompletionError::Generic);
    }

    let value = response.json::<Value>().await.map_err(|err| {
        warn!("Chat completion returned unparseable body: {err}");
        CompletionError::Generic
    })?;

    let content = value
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    if content.is_empty() {
        warn!(
            "Chat completion response had no content: {}",
            truncate_for_log(&value.to_string(), 2000)
        );
        return Err(CompletionError::Generic);
    }
    Ok(content)
}

/// Runs one completion over the assembled context with the configured
/// sampling parameters. Rate limits are retried up to three attempts with
/// `20 * attempt` seconds of backoff between them.
pub async fn complete(
    system_prompt: Option<&str>,
    summary: Option<&str>,
    window: &[ChatTurn],
    user_message: &str,
    tier: ModelTier,
) -> Result<String, CompletionError> {
    let messages = build_chat_messages(system_prompt, summary, window, user_message);
    let payload = json!({
        "model": tier.model_id(),
        "messages": messages,
        "max_tokens": CONFIG.max_tokens,
        "temperature": CONFIG.temperature,
        "top_p": CONFIG.top_p,
    });

    retry_on_rate_limit(|attempt| {
        let payload = payload.clone();
        async move {
            debug!(
                "Chat completion attempt {attempt}/{MAX_COMPLETION_ATTEMPTS}, model={}",
                payload.get("model").and_then(|v| v.as_str()).unwrap_or("unknown")
            );
            call_chat_api(&payload).await
        }
    })
    .await
}

/// Appends quality qualifiers to short or quality-term-free prompts.
fn enhance_image_prompt(prompt: &str) -> String {
    if prompt.chars().count() < SHORT_PROMPT_THRESHOLD {
        return format!("{prompt}, high quality, detailed, 4k, realistic");
    }

    let lowered = prompt.to_lowercase();
    let has_quality = QUALITY_TERMS.iter().any(|term| lowered.contains(term));
    if !has_quality {
        return format!("{prompt}, high quality");
    }

    prompt.to_string()
}

/// Generates one image and returns its URL. The subscription gate is
/// checked again here even though the command flow gates earlier.
pub async fn generate_image(
    db: &Database,
    user_id: i64,
    prompt: &str,
    size: Option<&str>,
) -> Result<String, ImageError> {
    let subscribed = billing::is_subscribed(db, user_id)
        .await
        .map_err(|err| ImageError::Failed(err.to_string()))?;
    if !subscribed {
        return Err(ImageError::NotSubscribed);
    }

    let image_size = size.unwrap_or(&CONFIG.image_size);
    let enhanced_prompt = enhance_image_prompt(prompt);

    info!(
        "Generating image for user {user_id} with prompt: {}",
        truncate_for_log(prompt, 200)
    );
    let payload = json!({
        "model": CONFIG.image_model,
        "prompt": enhanced_prompt,
        "size": image_size,
        "quality": CONFIG.image_quality,
        "n": 1,
    });

    let response = http_client()
        .post(format!(
            "{}/images/generations",
            CONFIG.openai_base_url.trim_end_matches('/')
        ))
        .bearer_auth(&CONFIG.openai_api_key)
        .timeout(IMAGE_REQUEST_TIMEOUT)
        .json(&payload)
        .send()
        .await
        .map_err(|err| {
            warn!("Image generation transport error: {err}");
            ImageError::Failed(err.to_string())
        })?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        warn!("Image generation rate limit exceeded for user {user_id}");
        return Err(ImageError::RateLimited);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(
            "Image generation failed: status={status}, body={}",
            truncate_for_log(&body, 2000)
        );
        return Err(ImageError::Failed(format!("сервер вернул статус {status}")));
    }

    let value = response
        .json::<Value>()
        .await
        .map_err(|err| ImageError::Failed(err.to_string()))?;
    let url = value
        .pointer("/data/0/url")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    match url {
        Some(url) => {
            info!("Image generated successfully for user {user_id}");
            Ok(url)
        }
        None => {
            warn!(
                "Image generation response had no URL: {}",
                truncate_for_log(&value.to_string(), 2000)
            );
            Err(ImageError::Failed("пустой ответ сервера".to_string()))
        }
    }
}

fn flagged_categories(result: &Value) -> Vec<String> {
    result
        .get("categories")
        .and_then(|v| v.as_object())
        .map(|categories| {
            categories
                .iter()
                .filter(|(_, flagged)| flagged.as_bool().unwrap_or(false))
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default()
}

async fn call_moderation_api(text: &str) -> anyhow::Result<Value> {
    let response = http_client()
        .post(format!(
            "{}/moderations",
            CONFIG.openai_base_url.trim_end_matches('/')
        ))
        .bearer_auth(&CONFIG.openai_api_key)
        .json(&json!({ "input": text }))
        .send()
        .await?
        .error_for_status()?;
    Ok(response.json::<Value>().await?)
}

/// Maps the moderation outcome to a safe/unsafe verdict. Outages fail
/// open so a service hiccup never blocks legitimate users.
fn moderation_verdict(outcome: anyhow::Result<Value>, text: &str) -> bool {
    let value = match outcome {
        Ok(value) => value,
        Err(err) => {
            warn!("Moderation request failed, allowing text: {err}");
            return true;
        }
    };

    let result = value.pointer("/results/0").cloned().unwrap_or(Value::Null);
    let flagged = result
        .get("flagged")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if flagged {
        warn!(
            "Unsafe prompt detected. Categories: {:?}. Prompt: {}",
            flagged_categories(&result),
            truncate_for_log(text, 200)
        );
    }
    !flagged
}

/// True means the text is safe to use.
pub async fn check_moderation(text: &str) -> bool {
    moderation_verdict(call_moderation_api(text).await, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: &str, content: &str) -> ChatTurn {
        ChatTurn {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn chat_messages_keep_the_documented_order() {
        let window = vec![turn("user", "раз"), turn("assistant", "два")];
        let messages = build_chat_messages(Some("будь добрым"), Some("говорили о музыке"), &window, "три");

        let roles: Vec<&str> = messages
            .iter()
            .map(|m| m.get("role").and_then(|v| v.as_str()).unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "system", "user", "assistant", "user"]);
        assert_eq!(
            messages[1].get("content").and_then(|v| v.as_str()).unwrap(),
            "Summary: говорили о музыке"
        );
        assert_eq!(
            messages[4].get("content").and_then(|v| v.as_str()).unwrap(),
            "три"
        );
    }

    #[test]
    fn chat_messages_skip_absent_system_parts() {
        let messages = build_chat_messages(None, None, &[], "привет");
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].get("role").and_then(|v| v.as_str()).unwrap(),
            "user"
        );
    }

    #[test]
    fn short_prompts_get_the_full_qualifier_suffix() {
        assert_eq!(
            enhance_image_prompt("кот"),
            "кот, high quality, detailed, 4k, realistic"
        );
    }

    #[test]
    fn long_prompts_without_quality_terms_get_high_quality_appended() {
        assert_eq!(
            enhance_image_prompt("sunset over mountains"),
            "sunset over mountains, high quality"
        );
    }

    #[test]
    fn prompts_with_quality_terms_are_left_alone() {
        let prompt = "a detailed painting of a harbor at dawn";
        assert_eq!(enhance_image_prompt(prompt), prompt);
        let russian = "закат над морем, высокое качество";
        assert_eq!(enhance_image_prompt(russian), russian);
    }

    #[test]
    fn quality_term_match_is_case_insensitive() {
        let prompt = "a 4K render of a mountain village";
        assert_eq!(enhance_image_prompt(prompt), prompt);
    }

    #[test]
    fn backoff_grows_linearly_per_attempt() {
        assert_eq!(backoff_delay(1), Duration::from_secs(20));
        assert_eq!(backoff_delay(2), Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_is_retried_three_times_then_surfaces() {
        let start = tokio::time::Instant::now();
        let mut attempts = 0;
        let result = retry_on_rate_limit(|_| {
            attempts += 1;
            async { Err(CompletionError::RateLimited) }
        })
        .await;

        assert_eq!(result, Err(CompletionError::RateLimited));
        assert_eq!(attempts, 3);
        // 20s after the first attempt, 40s after the second, no fourth try.
        assert_eq!(start.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_one_rate_limit_stops_retrying() {
        let mut attempts = 0;
        let result = retry_on_rate_limit(|attempt| {
            attempts += 1;
            async move {
                if attempt == 1 {
                    Err(CompletionError::RateLimited)
                } else {
                    Ok("ответ".to_string())
                }
            }
        })
        .await;

        assert_eq!(result, Ok("ответ".to_string()));
        assert_eq!(attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_not_retried() {
        let mut attempts = 0;
        let result = retry_on_rate_limit(|_| {
            attempts += 1;
            async { Err(CompletionError::Transient) }
        })
        .await;

        assert_eq!(result, Err(CompletionError::Transient));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn flagged_categories_lists_only_true_entries() {
        let result = serde_json::json!({
            "flagged": true,
            "categories": { "hate": false, "violence": true, "self-harm": true }
        });
        let mut categories = flagged_categories(&result);
        categories.sort();
        assert_eq!(categories, vec!["self-harm", "violence"]);
    }

    #[test]
    fn moderation_fails_open_when_the_service_errors() {
        assert!(moderation_verdict(
            Err(anyhow::anyhow!("connection refused")),
            "text"
        ));
    }

    #[test]
    fn moderation_verdict_follows_the_flagged_bit() {
        let flagged = serde_json::json!({
            "results": [{ "flagged": true, "categories": { "violence": true } }]
        });
        assert!(!moderation_verdict(Ok(flagged), "text"));

        let clean = serde_json::json!({
            "results": [{ "flagged": false, "categories": {} }]
        });
        assert!(moderation_verdict(Ok(clean), "text"));
    }
}
