use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use encoder_api::{
    Broker, Cipher, CollaboratorError, Component, DatastoreClient, EncryptedRecord, MessageHandler,
    SubscriptionHandle,
};
use encoder_api_server::{ENCODER_PATH_PREFIX, router};
use encoder_engine::{Collaborators, Encoder, EncoderConfig};
use encoder_storage_memory::MemoryStorage;

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, CollaboratorError>> + Send + 'a>>;

/// Accepts everything except topics under `refused/`.
struct OpenBroker {
    next: AtomicU64,
}

impl Component for OpenBroker {
    fn name(&self) -> &str {
        "broker"
    }
    fn start(&self) -> BoxFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }
    fn stop(&self) -> BoxFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

impl Broker for OpenBroker {
    fn subscribe(&self, topic: &str, _handler: Arc<dyn MessageHandler>) -> BoxFut<'_, SubscriptionHandle> {
        let topic = topic.to_string();
        Box::pin(async move {
            if topic.starts_with("refused/") {
                return Err(CollaboratorError::unavailable("broker went away"));
            }
            Ok(SubscriptionHandle {
                id: self.next.fetch_add(1, Ordering::SeqCst),
                topic,
            })
        })
    }
    fn unsubscribe(&self, _handle: &SubscriptionHandle) -> BoxFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

struct PrefixCipher;

impl Component for PrefixCipher {
    fn name(&self) -> &str {
        "cipher"
    }
    fn start(&self) -> BoxFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }
    fn stop(&self) -> BoxFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

impl Cipher for PrefixCipher {
    fn check_recipient(&self, recipient_key: &str) -> Result<(), CollaboratorError> {
        if recipient_key.starts_with("age1") {
            Ok(())
        } else {
            Err(CollaboratorError::rejected("not an age recipient"))
        }
    }
    fn encrypt(&self, _recipient_key: &str, plaintext: Vec<u8>) -> BoxFut<'_, Vec<u8>> {
        Box::pin(async move { Ok(plaintext) })
    }
}

struct NullDatastore;

impl Component for NullDatastore {
    fn name(&self) -> &str {
        "datastore"
    }
    fn start(&self) -> BoxFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }
    fn stop(&self) -> BoxFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

impl DatastoreClient for NullDatastore {
    fn write(&self, _record: EncryptedRecord) -> BoxFut<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

async fn app() -> (Router, Encoder) {
    let config = EncoderConfig::parse(r#"encryption_password = "pw""#).unwrap();
    let encoder = Encoder::bootstrap(
        &config,
        Collaborators {
            storage: Arc::new(MemoryStorage::new()),
            broker: Arc::new(OpenBroker { next: AtomicU64::new(1) }),
            cipher: Arc::new(PrefixCipher),
            datastore: Arc::new(NullDatastore),
        },
    )
    .await
    .unwrap();
    let app = router(encoder.manager().clone(), encoder.metrics_registry().clone()).unwrap();
    (app, encoder)
}

async fn call(app: &Router, method: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let request = Request::post(format!("{ENCODER_PATH_PREFIX}/{method}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn create_and_delete_over_http() {
    let (app, encoder) = app().await;

    let (status, body) = call(
        &app,
        "CreateStream",
        serde_json::json!({
            "topic": "devices/42/temp",
            "recipient_key": "age1qyqszqgpqyqszqgpqyqszqgpqyqszqgpqyqszqgpqyqszqgpqyqs3290gq",
            "datastore_target": "bucket-7",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let uid = body["uid"].as_str().unwrap().to_string();
    assert_eq!(encoder.manager().routes().active_count(), 1);

    let (status, body) = call(&app, "DeleteStream", serde_json::json!({ "uid": uid })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({}));

    let (status, body) = call(&app, "DeleteStream", serde_json::json!({ "uid": uid })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn bad_requests_get_twirp_errors() {
    let (app, _encoder) = app().await;

    let (status, body) = call(
        &app,
        "CreateStream",
        serde_json::json!({ "topic": "a/#/b", "recipient_key": "age1x", "datastore_target": "t" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_argument");

    let (status, body) = call(&app, "CreateStream", serde_json::json!({ "topic": 7 })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "malformed");

    let (status, body) = call(
        &app,
        "CreateStream",
        serde_json::json!({ "topic": "refused/1", "recipient_key": "age1x", "datastore_target": "t" }),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "unavailable");
}

#[tokio::test]
async fn pulse_and_metrics() {
    let (app, _encoder) = app().await;

    let response = app
        .clone()
        .oneshot(Request::get("/pulse").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"ok");

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("encoder_active_streams"));
}

async fn scrape(app: &Router) -> String {
    let response = app
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn lifecycle_calls_show_up_in_metrics() {
    let (app, _encoder) = app().await;

    let (status, body) = call(
        &app,
        "CreateStream",
        serde_json::json!({ "topic": "devices/1/temp", "recipient_key": "age1x", "datastore_target": "t" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    call(&app, "DeleteStream", serde_json::json!({ "uid": body["uid"] })).await;
    call(&app, "DeleteStream", serde_json::json!({ "uid": "missing" })).await;
    call(&app, "CreateStream", serde_json::json!({ "topic": 7 })).await;

    let text = scrape(&app).await;
    assert!(text.contains(r#"encoder_rpc_requests_total{method="CreateStream"} 2"#), "{text}");
    assert!(text.contains(r#"encoder_rpc_requests_total{method="DeleteStream"} 2"#), "{text}");
    assert!(text.contains(r#"encoder_rpc_responses_total{code="ok",method="CreateStream"} 1"#), "{text}");
    assert!(text.contains(r#"encoder_rpc_responses_total{code="malformed",method="CreateStream"} 1"#), "{text}");
    assert!(text.contains(r#"encoder_rpc_responses_total{code="ok",method="DeleteStream"} 1"#), "{text}");
    assert!(text.contains(r#"encoder_rpc_responses_total{code="not_found",method="DeleteStream"} 1"#), "{text}");
    assert!(text.contains(r#"encoder_rpc_duration_seconds_count{method="DeleteStream"} 2"#), "{text}");
}

#[tokio::test]
async fn router_refuses_a_registry_it_already_instruments() {
    let (_app, encoder) = app().await;
    assert!(router(encoder.manager().clone(), encoder.metrics_registry().clone()).is_err());
}
