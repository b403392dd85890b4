//! HTTP surface tests driven through the router

use std::io::Read;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use swaphost::deploy::client::DeployClient;
use swaphost::errors::HostError;
use swaphost::server::serve::router;
use swaphost::server::state::ServerState;
use tower::ServiceExt;

use swaphost::srvman::Color;

use crate::support::{sign_package, Fixture, API_KEY, EMPTY_CONFIG};

const BOUNDARY: &str = "swaphost-test-boundary";

struct Part<'a> {
    name: &'a str,
    file_name: Option<&'a str>,
    data: Vec<u8>,
}

fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part.file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/gzip\r\n\r\n",
                    part.name, file_name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name).as_bytes(),
            ),
        }
        body.extend_from_slice(&part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn deploy_request(authorization: Option<&str>, parts: &[Part<'_>]) -> Request<Body> {
    let mut builder = Request::post("/swaphost-system/deploy").header(
        header::CONTENT_TYPE,
        format!("multipart/form-data; boundary={}", BOUNDARY),
    );
    if let Some(authorization) = authorization {
        builder = builder.header(header::AUTHORIZATION, authorization);
    }
    builder.body(Body::from(multipart_body(parts))).unwrap()
}

fn app(fixture: &Fixture) -> Router {
    router(Arc::new(ServerState::new(fixture.host.clone())))
}

/// Package and signature parts for a fresh project
fn signed_parts(fixture: &Fixture, version: &str) -> (Vec<u8>, String) {
    let project = fixture.project(version, EMPTY_CONFIG);
    let (mut file, signature) = sign_package(&project, &fixture.signing_key);
    let mut pkg = Vec::new();
    file.read_to_end(&mut pkg).unwrap();
    (pkg, hex::encode(signature))
}

/// Serve the router on an ephemeral port and return its base URL
async fn spawn_server(fixture: &Fixture) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = app(fixture);
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{}", addr)
}

fn server_error(err: HostError) -> String {
    match err {
        HostError::ServerError(msg) => msg,
        other => panic!("expected a server error, got {}", other),
    }
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_health_and_version() {
    let fixture = Fixture::new().await;

    let response = app(&fixture)
        .oneshot(Request::get("/swaphost-system/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(health["status"], "healthy");

    let response = app(&fixture)
        .oneshot(Request::get("/swaphost-system/version").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_deploy_requires_api_key() {
    let fixture = Fixture::new().await;
    let (pkg, signature) = signed_parts(&fixture, "v1");
    let parts = [
        Part {
            name: "pkg",
            file_name: Some("pkg.tar.gz"),
            data: pkg,
        },
        Part {
            name: "signature",
            file_name: None,
            data: signature.into_bytes(),
        },
    ];

    for authorization in [None, Some("swaphost wrong-key"), Some("Bearer test-api-key")] {
        let response = app(&fixture)
            .oneshot(deploy_request(authorization, &parts))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{:?}", authorization);
    }
    assert_eq!(fixture.host.color().await, None);
}

#[tokio::test]
async fn test_deploy_rejects_malformed_requests() {
    let fixture = Fixture::new().await;
    let authorization = format!("swaphost {}", API_KEY);
    let (pkg, signature) = signed_parts(&fixture, "v1");

    let missing_signature = [Part {
        name: "pkg",
        file_name: Some("pkg.tar.gz"),
        data: pkg.clone(),
    }];
    let missing_pkg = [Part {
        name: "signature",
        file_name: None,
        data: signature.clone().into_bytes(),
    }];
    let bad_hex = [
        Part {
            name: "pkg",
            file_name: Some("pkg.tar.gz"),
            data: pkg.clone(),
        },
        Part {
            name: "signature",
            file_name: None,
            data: b"not hex".to_vec(),
        },
    ];
    let wrong_signature = [
        Part {
            name: "pkg",
            file_name: Some("pkg.tar.gz"),
            data: pkg,
        },
        Part {
            name: "signature",
            file_name: None,
            data: "00".repeat(64).into_bytes(),
        },
    ];

    for parts in [&missing_signature[..], &missing_pkg[..], &bad_hex[..], &wrong_signature[..]] {
        let response = app(&fixture)
            .oneshot(deploy_request(Some(&authorization), parts))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
    assert_eq!(fixture.host.color().await, None);
}

#[tokio::test]
async fn test_deploy_then_serve() {
    let fixture = Fixture::new().await;
    let authorization = format!("swaphost {}", API_KEY);

    let response = app(&fixture)
        .oneshot(Request::get("/anything").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let (pkg, signature) = signed_parts(&fixture, "v1");
    let parts = [
        Part {
            name: "pkg",
            file_name: Some("pkg.tar.gz"),
            data: pkg,
        },
        Part {
            name: "signature",
            file_name: None,
            data: signature.into_bytes(),
        },
    ];
    let response = app(&fixture)
        .oneshot(deploy_request(Some(&authorization), &parts))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let deployed: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(deployed["color"], "blue");
    assert_eq!(deployed["digest"].as_str().unwrap().len(), 64);

    let response = app(&fixture)
        .oneshot(Request::get("/anything").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "v1");

    let response = app(&fixture)
        .oneshot(Request::get("/swaphost-system/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(status["color"], "blue");
    assert_eq!(status["deploy"]["state"], "idle");
    assert_eq!(status["deploy"]["succeeded"], 1);
}

#[tokio::test]
async fn test_deploy_client_against_running_server() {
    let fixture = Fixture::new().await;
    let url = spawn_server(&fixture).await;
    let deploy_key = hex::encode(fixture.signing_key.to_bytes());

    let client = DeployClient::new(&url, API_KEY, &deploy_key).unwrap();
    let body = client.deploy(fixture.project("v1", EMPTY_CONFIG)).await.unwrap();
    let deployed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(deployed["color"], "blue");
    assert_eq!(deployed["digest"].as_str().unwrap().len(), 64);
    assert_eq!(fixture.body().await, (StatusCode::OK, "v1".to_string()));

    let client = DeployClient::new(&url, "wrong-key", &deploy_key).unwrap();
    let msg = server_error(client.deploy(fixture.project("v2", EMPTY_CONFIG)).await.unwrap_err());
    assert!(msg.starts_with("HTTP 403"), "{}", msg);
    assert!(msg.contains("unknown api key"), "{}", msg);

    let client = DeployClient::new(&url, API_KEY, &hex::encode([9u8; 32])).unwrap();
    let msg = server_error(client.deploy(fixture.project("v3", EMPTY_CONFIG)).await.unwrap_err());
    assert!(msg.starts_with("HTTP 400"), "{}", msg);
    assert!(msg.contains("Invalid signature"), "{}", msg);

    assert_eq!(fixture.body().await, (StatusCode::OK, "v1".to_string()));
    assert_eq!(fixture.host.color().await, Some(Color::Blue));
}
