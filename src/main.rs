use std::{sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
  extract::State,
  http::StatusCode,
  response::{IntoResponse, Response},
  routing::{get, post},
  Json, Router,
};
use serde::Deserialize;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod convert;
mod delivery;
mod error;
mod extractor;
mod fetch;
mod pipeline;
mod resolver;
mod retry;
mod selector;
mod source;
mod storage;
mod transport;
mod util;

use error::Result;

use config::Config;
use convert::Converter;
use delivery::{Executor, Recipient, TelegramUploader};
use extractor::Http;
use fetch::Fetcher;
use pipeline::Pipeline;
use resolver::Resolver;
use retry::RetryPolicy;
use selector::Selector;
use source::{Profile, SourceRequest};
use storage::Storage;
use transport::Capabilities;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info")),
    )
    .init();

  let config = Config::from_env().context("invalid configuration")?;
  let listen_addr = config.listen_addr;
  let pipeline = Arc::new(build_pipeline(&config).await?);

  Toplevel::new(move |s: SubsystemHandle| async move {
    s.start(SubsystemBuilder::new("http", move |s: SubsystemHandle| {
      serve(s, listen_addr, pipeline)
    }));
  })
  .catch_signals()
  .handle_shutdown_requests(Duration::from_secs(30))
  .await?;

  Ok(())
}

async fn build_pipeline(config: &Config) -> anyhow::Result<Pipeline> {
  let client = reqwest::Client::builder()
    .connect_timeout(Duration::from_secs(20))
    .build()
    .context("failed to build http client")?;

  let http = Http::new(client.clone(), RetryPolicy::new(3, ms(500)));
  let converter = Converter::detect("ffmpeg").await;
  let storage = Storage::new(&config.download_dir, config.storage_capacity)
    .context("failed to prepare download directory")?;
  info!(
    dir = %storage.base_dir().display(),
    capacity = storage.capacity(),
    "download storage ready"
  );

  let mut uploader = TelegramUploader::new(
    client.clone(),
    config.bot_token.clone(),
    config.telegram_api.clone(),
  );
  let capable = match config.capable_api() {
    Some(api) => uploader.check_capable(api).await,
    None => false,
  };

  let executor = Executor::new(
    uploader,
    RetryPolicy::new(config.delivery_attempts, ms(1000))
      .with_max_delay(Duration::from_secs(10)),
    config.delivery_timeout,
  );

  Ok(Pipeline {
    resolver: Resolver::from_config(config, http),
    selector: Selector::new(converter.is_some()),
    fetcher: Fetcher::new(client, RetryPolicy::new(3, ms(500)), converter),
    storage,
    executor,
    capabilities: Capabilities { capable },
  })
}

fn ms(millis: u64) -> Duration {
  Duration::from_millis(millis)
}

async fn serve(
  subsys: SubsystemHandle,
  addr: std::net::SocketAddr,
  pipeline: Arc<Pipeline>,
) -> anyhow::Result<()> {
  let app = Router::new()
    .route("/health", get(health))
    .route("/relay", post(relay))
    .with_state(pipeline);

  info!("Listening on {}", addr);

  axum::Server::try_bind(&addr)?
    .serve(app.into_make_service())
    .with_graceful_shutdown(subsys.on_shutdown_requested())
    .await?;

  Ok(())
}

async fn health() -> impl IntoResponse {
  "ok".to_owned()
}

#[derive(Deserialize)]
struct RelayBody {
  url: String,
  profile: String,
  chat_id: i64,
  caption: Option<String>,
}

async fn relay(
  State(pipeline): State<Arc<Pipeline>>,
  Json(body): Json<RelayBody>,
) -> Result<Response> {
  let profile: Profile = body.profile.parse()?;
  let request = SourceRequest::new(&body.url, profile)?;
  let recipient = Recipient {
    chat_id: body.chat_id,
    caption: body.caption,
  };

  let report = pipeline.run(request, recipient).await?;
  let status = if report.outcome.success {
    StatusCode::OK
  } else {
    StatusCode::BAD_GATEWAY
  };

  Ok((status, Json(report)).into_response())
}
