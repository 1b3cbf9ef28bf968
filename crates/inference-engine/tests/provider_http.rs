//! End-to-end dispatch tests against mock provider endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::error::Error;
use common::models::{
    HuggingfaceOptions, ProviderDescriptor, ProviderKind, ReplicateOptions, StabilityOptions,
};
use inference_engine::{Dispatcher, DispatcherConfig, ReqwestTransport};
use provider_manager::{ProviderRegistry, SystemClock};

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        max_retries: 3,
        retry_delay: Duration::from_millis(10),
        poll_interval: Duration::from_millis(10),
        max_poll_attempts: 5,
    }
}

fn dispatcher_for(descriptor: ProviderDescriptor, key: &str) -> Dispatcher {
    let credentials = HashMap::from([(descriptor.id.clone(), vec![key.to_string()])]);
    let registry = ProviderRegistry::new(vec![descriptor], credentials, Arc::new(SystemClock)).unwrap();
    let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();

    Dispatcher::new(Arc::new(registry), Arc::new(transport), fast_config())
}

fn descriptor(id: &str, base_url: String, kind: ProviderKind, model: &str) -> ProviderDescriptor {
    ProviderDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        base_url,
        kind,
        daily_quota: 100,
        requires_auth: true,
        enabled: true,
        models: vec![model.to_string()],
    }
}

#[tokio::test]
async fn binary_response_is_returned_verbatim() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/sd-2"))
        .and(header("authorization", "Bearer hf-1"))
        .and(body_partial_json(json!({"inputs": "a quiet harbour"})))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\x89PNG-binary".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(
        descriptor(
            "huggingface",
            format!("{}/models", server.uri()),
            ProviderKind::Huggingface(HuggingfaceOptions::default()),
            "sd-2",
        ),
        "hf-1",
    );

    let image = dispatcher.generate("a quiet harbour").await.unwrap();

    assert_eq!(image.bytes.as_ref(), b"\x89PNG-binary");
    assert_eq!(image.model, "sd-2");
}

#[tokio::test]
async fn embedded_base64_is_decoded() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/generation/sdxl/text-to-image"))
        .and(header("accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "artifacts": [{"base64": STANDARD.encode(b"stability-image"), "finishReason": "SUCCESS"}]
        })))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(
        descriptor(
            "stability",
            format!("{}/v1/generation", server.uri()),
            ProviderKind::StabilityAi(StabilityOptions::default()),
            "sdxl",
        ),
        "sk-1",
    );

    let image = dispatcher.generate("a quiet harbour").await.unwrap();

    assert_eq!(image.bytes.as_ref(), b"stability-image");
    assert_eq!(dispatcher.registry().usage("stability").unwrap().success_calls, 1);
}

#[tokio::test]
async fn async_job_is_polled_until_output() {
    let server = MockServer::start().await;
    let uri = server.uri();

    Mock::given(method("POST"))
        .and(path("/v1/predictions"))
        .and(header("authorization", "Token r8-1"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "p1",
            "status": "starting",
            "urls": {"get": format!("{}/v1/predictions/p1", uri)}
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/predictions/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "processing"})))
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/predictions/p1"))
        .and(header("authorization", "Token r8-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "succeeded",
            "output": [format!("{}/files/out.png", uri)]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/files/out.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"replicate-image".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(
        descriptor(
            "replicate",
            format!("{}/v1/predictions", uri),
            ProviderKind::Replicate(ReplicateOptions::default()),
            "stability-ai/stable-diffusion",
        ),
        "r8-1",
    );

    let image = dispatcher.generate("a quiet harbour").await.unwrap();

    assert_eq!(image.bytes.as_ref(), b"replicate-image");
}

#[tokio::test]
async fn rate_limit_is_retried_then_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/sd-2"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/models/sd-2"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"late-image".to_vec()))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(
        descriptor(
            "huggingface",
            format!("{}/models", server.uri()),
            ProviderKind::Huggingface(HuggingfaceOptions::default()),
            "sd-2",
        ),
        "hf-1",
    );

    let image = dispatcher.generate("a quiet harbour").await.unwrap();
    assert_eq!(image.attempts, 3);

    let report = dispatcher.registry().usage_report();
    assert_eq!(report["huggingface"].total_calls, 3);
    assert_eq!(report["huggingface"].today_calls, 3);
}

#[tokio::test]
async fn failed_async_job_exhausts_retries() {
    let server = MockServer::start().await;
    let uri = server.uri();

    Mock::given(method("POST"))
        .and(path("/v1/predictions"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "urls": {"get": format!("{}/v1/predictions/p9", uri)}
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/predictions/p9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "failed",
            "error": "prediction interrupted"
        })))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(
        descriptor(
            "replicate",
            format!("{}/v1/predictions", uri),
            ProviderKind::Replicate(ReplicateOptions::default()),
            "stability-ai/stable-diffusion",
        ),
        "r8-1",
    );

    match dispatcher.generate("a quiet harbour").await.unwrap_err() {
        Error::GenerationFailed {
            after_attempts,
            last_error,
        } => {
            assert_eq!(after_attempts, 3);
            assert!(last_error.unwrap().contains("prediction interrupted"));
        }
        other => panic!("unexpected error: {}", other),
    }

    assert_eq!(dispatcher.registry().usage("replicate").unwrap().fail_calls, 3);
}
