use std::sync::Arc;

use httpmock::prelude::*;
use provisioner::client::{HostingApi, HttpHostingApi};
use provisioner::config_store::{ApiCredentials, ConfigStore, InMemoryConfigStore};
use provisioner::crypto::AesGcmCipher;
use provisioner::error::ProvisioningError;
use provisioner::models::{NewService, RemoteId, ServiceStatus};
use provisioner::rate_limiter::RateLimiter;
use provisioner::telemetry::{IntegrationLog, LogFilter, LogLevel};
use serde_json::json;

async fn client(server: &MockServer) -> (HttpHostingApi, Arc<IntegrationLog>) {
    let config = Arc::new(InMemoryConfigStore::new(Arc::new(
        AesGcmCipher::from_secret("client-test").unwrap(),
    )));
    config
        .save_credentials(&ApiCredentials {
            api_url: server.base_url(),
            api_token: "tok-123".into(),
        })
        .await
        .unwrap();
    let log = Arc::new(IntegrationLog::new(true));
    let api = HttpHostingApi::new(config, RateLimiter::new(55), log.clone()).unwrap();
    (api, log)
}

#[tokio::test]
async fn user_lookup_unwraps_envelope_and_sends_bearer_token() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/api/admin/users")
                .query_param("email", "a@x.com")
                .header("authorization", "Bearer tok-123");
            then.status(200).json_body(json!({
                "data": [{"id": 42, "email": "a@x.com", "first_name": "Ann"}]
            }));
        })
        .await;

    let (api, _) = client(&server).await;
    let user = api.get_user_by_email("a@x.com").await.unwrap();
    mock.assert_async().await;
    assert_eq!(user.id, RemoteId::from("42"));
    assert_eq!(user.first_name.as_deref(), Some("Ann"));
}

#[tokio::test]
async fn empty_user_list_is_not_found() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/admin/users");
            then.status(200).json_body(json!({ "data": [] }));
        })
        .await;

    let (api, _) = client(&server).await;
    let err = api.get_user_by_email("nobody@x.com").await.unwrap_err();
    assert!(matches!(err, ProvisioningError::NotFound(_)));
}

#[tokio::test]
async fn error_status_keeps_message_and_logs_raw_body() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/admin/services")
                .json_body(json!({"user_id": "u-1", "plan_id": "plan-a", "domain": "x.com"}));
            then.status(422)
                .json_body(json!({"message": "domain taken", "trace": "internal"}));
        })
        .await;

    let (api, log) = client(&server).await;
    let err = api
        .create_service(&NewService {
            user_id: RemoteId::from("u-1"),
            plan_id: "plan-a".into(),
            domain: "x.com".into(),
        })
        .await
        .unwrap_err();
    match err {
        ProvisioningError::Api {
            status,
            message,
            raw_body,
        } => {
            assert_eq!(status, 422);
            assert_eq!(message, "domain taken");
            assert!(raw_body.contains("internal"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let entries = log.query(&LogFilter {
        event_type: Some("service_create".into()),
        status: Some("failed".into()),
        ..LogFilter::default()
    });
    assert_eq!(entries.len(), 1);
    assert!(entries[0].context["response"]
        .as_str()
        .unwrap()
        .contains("internal"));
}

#[tokio::test]
async fn non_json_error_body_uses_generic_message() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/admin/services/9");
            then.status(500).body("<html>oops</html>");
        })
        .await;

    let (api, _) = client(&server).await;
    let err = api.get_service(&RemoteId::from(9u64)).await.unwrap_err();
    assert!(matches!(
        err,
        ProvisioningError::Api { status: 500, ref message, .. } if message == "Unknown API error"
    ));
}

#[tokio::test]
async fn service_status_and_credentials_decode() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/admin/services/9");
            then.status(200).json_body(json!({
                "data": {"id": 9, "user_id": "u-1", "plan_id": 3, "domain": "x.com", "status": "active"}
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/admin/services/9/credentials");
            then.status(200).json_body(json!({
                "data": {"username": "siteadmin", "password": "pw", "sftp_host": "sftp.x.com"}
            }));
        })
        .await;

    let (api, _) = client(&server).await;
    let service_id = RemoteId::from(9u64);
    let service = api.get_service(&service_id).await.unwrap();
    assert_eq!(service.status, ServiceStatus::Active);
    assert_eq!(service.plan_id, Some(RemoteId::from("3")));

    let credentials = api.get_service_credentials(&service_id).await.unwrap();
    assert_eq!(credentials.username, "siteadmin");
    assert_eq!(credentials.extra["sftp_host"], "sftp.x.com");
}

#[tokio::test]
async fn service_actions_hit_their_endpoints() {
    let server = MockServer::start_async().await;
    let suspend = server
        .mock_async(|when, then| {
            when.method(POST).path("/api/admin/services/9/suspend");
            then.status(200).json_body(json!({"data": {"status": "suspended"}}));
        })
        .await;
    let cancel = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/api/admin/services/9");
            then.status(204);
        })
        .await;

    let (api, _) = client(&server).await;
    let service_id = RemoteId::from("9");
    api.suspend_service(&service_id).await.unwrap();
    api.cancel_service(&service_id).await.unwrap();
    suspend.assert_async().await;
    cancel.assert_async().await;
}

#[tokio::test]
async fn connection_test_reports_failure_without_erroring() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/admin/plans").query_param("limit", "1");
            then.status(401).json_body(json!({"message": "invalid token"}));
        })
        .await;

    let (api, _) = client(&server).await;
    let check = api.test_connection().await;
    assert!(!check.success);
    assert!(check.message.contains("invalid token"));
}

#[tokio::test]
async fn missing_credentials_fail_before_any_request() {
    let config = Arc::new(InMemoryConfigStore::new(Arc::new(
        AesGcmCipher::from_secret("client-test").unwrap(),
    )));
    let api = HttpHostingApi::new(
        config,
        RateLimiter::new(55),
        Arc::new(IntegrationLog::new(false)),
    )
    .unwrap();
    let err = api.get_plan("plan-a").await.unwrap_err();
    assert_eq!(
        err,
        ProvisioningError::validation("API credentials not configured")
    );
}

#[tokio::test]
async fn successful_response_without_a_data_document_is_a_decode_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/admin/services/9");
            then.status(200).body("not json");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/admin/services/10");
            then.status(200).json_body(json!({"ok": true}));
        })
        .await;

    let (api, log) = client(&server).await;
    let err = api.get_service(&RemoteId::from(9u64)).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::Decode(_)), "{err:?}");
    let err = api.get_service(&RemoteId::from(10u64)).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::Decode(_)), "{err:?}");
    assert!(err.is_retryable());

    let failures = log.query(&LogFilter {
        event_type: Some("service_get".into()),
        status: Some("failed".into()),
        ..LogFilter::default()
    });
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].context["error_kind"], "decode");
}

#[tokio::test]
async fn outcomes_are_info_and_request_traces_are_debug() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/api/admin/services/9");
            then.status(200).json_body(json!({
                "data": {"id": 9, "status": "active"}
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/admin/services/9/suspend");
            then.status(200).json_body(json!({"data": {"status": "suspended"}}));
        })
        .await;

    let (api, log) = client(&server).await;
    let service_id = RemoteId::from(9u64);
    api.get_service(&service_id).await.unwrap();
    api.suspend_service(&service_id).await.unwrap();

    let retrieved = log.query(&LogFilter {
        event_type: Some("service_get".into()),
        level: Some(LogLevel::Info),
        ..LogFilter::default()
    });
    assert_eq!(retrieved.len(), 1);
    assert_eq!(retrieved[0].status, "success");
    assert_eq!(retrieved[0].context["service_status"], "active");

    let requested = log.query(&LogFilter {
        event_type: Some("service_suspend".into()),
        level: Some(LogLevel::Debug),
        ..LogFilter::default()
    });
    assert_eq!(requested.len(), 1);
    assert_eq!(requested[0].message, "Requesting service suspend");
    assert_eq!(
        log.count(&LogFilter {
            event_type: Some("service_suspend".into()),
            level: Some(LogLevel::Info),
            ..LogFilter::default()
        }),
        1
    );
}
