use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::config::{HttpConfig, SinkConfig};
use crate::error::ForwardError;
use crate::sink::{AddRequest, BookmarkSink};

#[derive(Debug, Serialize)]
struct AddBody<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<String>,
    favorite: u8,
    consumer_key: &'a str,
    access_token: &'a str,
}

#[derive(Debug, Serialize)]
struct SendBody<'a> {
    consumer_key: &'a str,
    access_token: &'a str,
    actions: Vec<Action<'a>>,
}

#[derive(Debug, Serialize)]
struct Action<'a> {
    action: &'static str,
    item_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    item: Option<AddedItem>,
}

#[derive(Debug, Deserialize)]
struct AddedItem {
    item_id: JsonValue,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    action_results: Vec<JsonValue>,
    #[serde(default)]
    status: i64,
}

/// Pocket answers with the item id as either a string or a number.
fn item_id_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct PocketClient {
    client: Client,
    base_url: String,
    consumer_key: String,
    access_token: String,
}

impl PocketClient {
    pub fn new(sink: &SinkConfig, http: &HttpConfig) -> Result<Self, ForwardError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(http.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            base_url: sink.base_url.trim_end_matches('/').to_string(),
            consumer_key: sink.consumer_key.clone(),
            access_token: sink.access_token.clone(),
        })
    }

    async fn post<B: Serialize + Sync>(&self, endpoint: &str, body: &B) -> Result<Response, ForwardError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        debug!(url = %url, "posting to pocket");

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json; charset=UTF-8")
            .header("X-Accept", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        // Pocket puts the reason in X-Error rather than the body.
        let reason = response
            .headers()
            .get("X-Error")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.text().await.unwrap_or_default();
        let detail = match reason {
            Some(reason) => reason,
            None => body,
        };

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(ForwardError::Auth {
                status: status.as_u16(),
                detail,
            })
        } else {
            Err(ForwardError::Status {
                status: status.as_u16(),
                detail,
            })
        }
    }
}

#[async_trait]
impl BookmarkSink for PocketClient {
    async fn add(&self, request: &AddRequest<'_>) -> Result<String, ForwardError> {
        let body = AddBody {
            url: request.url,
            title: request.title,
            tags: if request.tags.is_empty() {
                None
            } else {
                Some(request.tags.join(","))
            },
            favorite: if request.favorite { 1 } else { 0 },
            consumer_key: &self.consumer_key,
            access_token: &self.access_token,
        };

        let response = self.post("add", &body).await?;
        let parsed: AddResponse = response
            .json()
            .await
            .map_err(|e| ForwardError::Response(format!("invalid add response: {e}")))?;

        parsed
            .item
            .as_ref()
            .and_then(|item| item_id_to_string(&item.item_id))
            .ok_or_else(|| ForwardError::Response("add response carried no item_id".to_string()))
    }

    async fn favorite(&self, item_id: &str) -> Result<(), ForwardError> {
        let body = SendBody {
            consumer_key: &self.consumer_key,
            access_token: &self.access_token,
            actions: vec![Action {
                action: "favorite",
                item_id,
            }],
        };

        let response = self.post("send", &body).await?;
        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| ForwardError::Response(format!("invalid send response: {e}")))?;

        let accepted = parsed.status == 1 && parsed.action_results.iter().all(|r| r.as_bool() != Some(false));
        if accepted {
            Ok(())
        } else {
            Err(ForwardError::Response(format!("favorite of item {item_id} was not applied")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_body_shape() {
        let tags = vec!["rust".to_string(), "async".to_string()];
        let body = AddBody {
            url: "https://a.example",
            title: None,
            tags: Some(tags.join(",")),
            favorite: 1,
            consumer_key: "ck",
            access_token: "at",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["tags"], "rust,async");
        assert_eq!(json["favorite"], 1);
        assert!(json.get("title").is_none());
    }

    #[test]
    fn test_item_id_accepts_string_or_number() {
        assert_eq!(item_id_to_string(&serde_json::json!("123")), Some("123".to_string()));
        assert_eq!(item_id_to_string(&serde_json::json!(456)), Some("456".to_string()));
        assert_eq!(item_id_to_string(&serde_json::json!("")), None);
        assert_eq!(item_id_to_string(&JsonValue::Null), None);
    }
}
