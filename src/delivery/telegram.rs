use std::time::Duration;

use async_trait::async_trait;
use http_types::Url;
use reqwest::{
  multipart::{Form, Part},
  Body, StatusCode,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::{error::DeliveryError, fetch::Artifact, transport::Transport};

use super::{Container, Recipient, Uploader};

/// Uploads through the Telegram Bot API. The light transport is the hosted
/// API; the capable one a self-hosted server with no 50 MiB upload cap.
#[derive(Clone)]
pub struct TelegramUploader {
  client: reqwest::Client,
  token: String,
  light_api: Url,
  capable_api: Option<Url>,
}

#[derive(Deserialize, Default, Debug)]
struct ApiReply {
  #[serde(default)]
  ok: bool,
  description: Option<String>,
  error_code: Option<u16>,
  parameters: Option<ReplyParameters>,
}

#[derive(Deserialize, Default, Debug)]
struct ReplyParameters {
  retry_after: Option<u64>,
}

impl TelegramUploader {
  pub fn new(client: reqwest::Client, token: String, light_api: Url) -> Self {
    Self {
      client,
      token,
      light_api,
      capable_api: None,
    }
  }

  /// Enables the capable transport if the server at `api` answers `getMe`
  /// for our bot. Returns whether it did.
  pub async fn check_capable(&mut self, api: &Url) -> bool {
    let Some(url) = method_url(api, &self.token, "getMe") else {
      return false;
    };

    let reply = self
      .client
      .get(url)
      .timeout(Duration::from_secs(10))
      .send()
      .await;
    let ok = match reply {
      Ok(resp) => resp.json::<ApiReply>().await.map_or(false, |r| r.ok),
      Err(e) => {
        warn!(api = %api, "capable transport unreachable: {}", e.without_url());
        false
      }
    };

    if ok {
      info!(api = %api, "capable transport enabled");
      self.capable_api = Some(api.clone());
    } else {
      warn!(api = %api, "capable transport disabled");
    }
    ok
  }

  fn endpoint(
    &self,
    transport: Transport,
    container: Container,
  ) -> Result<Url, DeliveryError> {
    let api = match transport {
      Transport::Light => &self.light_api,
      Transport::Capable => self
        .capable_api
        .as_ref()
        .ok_or(DeliveryError::Unavailable(transport))?,
    };
    let (method, _) = method_and_field(container);

    method_url(api, &self.token, method)
      .ok_or_else(|| DeliveryError::Rejected("invalid api url".into()))
  }
}

#[async_trait]
impl Uploader for TelegramUploader {
  async fn upload(
    &self,
    transport: Transport,
    container: Container,
    artifact: &Artifact,
    recipient: &Recipient,
  ) -> Result<(), DeliveryError> {
    let url = self.endpoint(transport, container)?;
    let (_, field) = method_and_field(container);

    let file = artifact
      .open()
      .await
      .map_err(|e| DeliveryError::IO(e.to_string()))?;
    let body = Body::wrap_stream(ReaderStream::new(file));
    let part = Part::stream_with_length(body, artifact.size())
      .file_name(artifact.file_name())
      .mime_str(artifact.mime_type())
      .map_err(|e| DeliveryError::Rejected(e.without_url().to_string()))?;

    let mut form = Form::new()
      .text("chat_id", recipient.chat_id.to_string())
      .part(field, part);
    if let Some(caption) = &recipient.caption {
      form = form.text("caption", caption.clone());
    }
    match container {
      Container::Video => form = form.text("supports_streaming", "true"),
      Container::Audio => {
        if let Some(title) = &artifact.title {
          form = form.text("title", title.clone());
        }
      }
      Container::Document => (),
    }

    let resp = self
      .client
      .post(url)
      .multipart(form)
      .send()
      .await
      .map_err(network_error)?;
    let status = resp.status();
    // error replies are json too, but a proxy in front may answer with html
    let reply = resp.json::<ApiReply>().await.unwrap_or_default();

    classify_reply(status, reply, transport)
  }
}

fn method_and_field(container: Container) -> (&'static str, &'static str) {
  match container {
    Container::Video => ("sendVideo", "video"),
    Container::Audio => ("sendAudio", "audio"),
    Container::Document => ("sendDocument", "document"),
  }
}

// a token is `<digits>:<secret>`, so a bare `bot{token}` parses as a scheme
fn method_url(api: &Url, token: &str, method: &str) -> Option<Url> {
  api.join(&format!("./bot{token}/{method}")).ok()
}

// the request url embeds the bot token; never let it reach an error message
fn network_error(err: reqwest::Error) -> DeliveryError {
  if err.is_timeout() {
    DeliveryError::Timeout
  } else {
    DeliveryError::Network(err.without_url().to_string())
  }
}

fn classify_reply(
  status: StatusCode,
  reply: ApiReply,
  transport: Transport,
) -> Result<(), DeliveryError> {
  if status.is_success() && reply.ok {
    return Ok(());
  }

  let code = reply.error_code.unwrap_or(status.as_u16());
  let description = reply.description.unwrap_or_else(|| status.to_string());
  let lower = description.to_ascii_lowercase();

  let err = match code {
    401 | 403 => DeliveryError::Unauthorized(description),
    413 => DeliveryError::TooLarge(transport),
    _ if lower.contains("too big") || lower.contains("too large") => {
      DeliveryError::TooLarge(transport)
    }
    429 => {
      let retry_after = reply
        .parameters
        .and_then(|p| p.retry_after)
        .unwrap_or(1);
      DeliveryError::RateLimited(Duration::from_secs(retry_after))
    }
    500..=599 => DeliveryError::Upstream(code),
    _ => DeliveryError::Rejected(description),
  };
  Err(err)
}

#[cfg(test)]
mod test {
  use std::sync::{Arc, Mutex};

  use axum::{extract::Path, routing::any, Json, Router};
  use serde_json::{json, Value};

  use super::*;
  use crate::{
    delivery::test::sample_artifact, fetch::test::serve, fetch::ArtifactKind,
    storage::Storage,
  };

  fn reply(value: Value) -> ApiReply {
    serde_json::from_value(value).unwrap()
  }

  #[test]
  fn test_classify_reply() {
    let light = Transport::Light;

    assert_eq!(
      classify_reply(StatusCode::OK, reply(json!({"ok": true})), light),
      Ok(())
    );
    assert_eq!(
      classify_reply(
        StatusCode::TOO_MANY_REQUESTS,
        reply(json!({"ok": false, "error_code": 429,
          "description": "Too Many Requests: retry after 7",
          "parameters": {"retry_after": 7}})),
        light
      ),
      Err(DeliveryError::RateLimited(Duration::from_secs(7)))
    );
    assert_eq!(
      classify_reply(
        StatusCode::BAD_REQUEST,
        reply(json!({"ok": false, "error_code": 400,
          "description": "Bad Request: file is too big"})),
        light
      ),
      Err(DeliveryError::TooLarge(light))
    );
    assert!(matches!(
      classify_reply(
        StatusCode::UNAUTHORIZED,
        reply(json!({"ok": false, "error_code": 401,
          "description": "Unauthorized"})),
        light
      ),
      Err(DeliveryError::Unauthorized(_))
    ));
    assert!(matches!(
      classify_reply(
        StatusCode::BAD_REQUEST,
        reply(json!({"ok": false, "error_code": 400,
          "description": "Bad Request: chat not found"})),
        light
      ),
      Err(DeliveryError::Rejected(_))
    ));
    // non-json reply from a gateway
    assert_eq!(
      classify_reply(StatusCode::BAD_GATEWAY, ApiReply::default(), light),
      Err(DeliveryError::Upstream(502))
    );
  }

  #[test]
  fn test_method_url_keeps_base_path() {
    let api: Url = "http://bot-api:8081/custom/".parse().unwrap();
    assert_eq!(
      method_url(&api, "123456:ABC-def", "sendVideo")
        .unwrap()
        .as_str(),
      "http://bot-api:8081/custom/bot123456:ABC-def/sendVideo"
    );

    let hosted: Url = "https://api.telegram.org/".parse().unwrap();
    assert_eq!(
      method_url(&hosted, "123456:ABC-def", "getMe")
        .unwrap()
        .as_str(),
      "https://api.telegram.org/bot123456:ABC-def/getMe"
    );
  }

  #[tokio::test]
  async fn test_upload_against_local_api() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let router = Router::new().route(
      "/:bot/:method",
      any({
        let seen = seen.clone();
        move |Path((bot, method)): Path<(String, String)>| async move {
          seen.lock().unwrap().push(format!("{bot}/{method}"));
          Json(json!({"ok": true, "result": {}}))
        }
      }),
    );
    let addr = serve(router);
    let api: Url = format!("http://{addr}/").parse().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(dir.path(), 1024).unwrap();
    let artifact = sample_artifact(&storage, ArtifactKind::Audio).await;
    let recipient = Recipient {
      chat_id: 7,
      caption: Some("hello".into()),
    };

    let mut uploader = TelegramUploader::new(
      reqwest::Client::new(),
      "123456:ABC-def".into(),
      api.clone(),
    );
    assert_eq!(
      uploader
        .upload(Transport::Capable, Container::Audio, &artifact, &recipient)
        .await,
      Err(DeliveryError::Unavailable(Transport::Capable))
    );

    assert!(uploader.check_capable(&api).await);
    uploader
      .upload(Transport::Light, Container::Audio, &artifact, &recipient)
      .await
      .unwrap();
    uploader
      .upload(Transport::Capable, Container::Document, &artifact, &recipient)
      .await
      .unwrap();

    assert_eq!(
      *seen.lock().unwrap(),
      vec![
        "bot123456:ABC-def/getMe",
        "bot123456:ABC-def/sendAudio",
        "bot123456:ABC-def/sendDocument",
      ]
    );
  }
}
