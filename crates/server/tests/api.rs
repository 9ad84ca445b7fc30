//! HTTP surface: auth, rate limiting, validation and status snapshots.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use visage_core::{DetectedPerson, DetectionResult, DetectionTask, Gender, TaskStatus};
use visage_store::TaskStore;

use common::*;

fn idle() -> Harness {
    harness(ScriptedDetector::new(vec![Ok(vec![])]), HarnessOptions::default())
}

#[tokio::test]
async fn health_needs_no_key() {
    let h = idle();
    let response = h
        .router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "Human Detection API");
    assert_eq!(body["queue"]["waiting"], 0);
    assert_eq!(body["rate_limiter_reachable"], true);
}

#[tokio::test]
async fn upload_then_status_is_pending() {
    let h = idle();

    let response = h.router.clone().oneshot(image_upload(Some(API_KEY))).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = json_body(response).await;
    assert_eq!(body["status"], "pending");
    let task_id = body["taskId"].as_str().unwrap().to_string();

    let response = h
        .router
        .clone()
        .oneshot(status_request(Some(API_KEY), &task_id))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["taskId"], task_id.as_str());
    assert_eq!(body["status"], "pending");
    assert!(body["result"].is_null());
    assert!(body["error"].is_null());
    assert!(body["createdAt"].as_str().unwrap().contains('T'));

    let task = h.tasks.find_by_id(&task_id).await.unwrap().unwrap();
    assert_eq!(task.artifact_path, format!("uploads/{task_id}.png"));
    assert!(h.artifacts.exists(&task.artifact_path).await.unwrap());
}

#[tokio::test]
async fn missing_key_is_rejected_without_touching_state() {
    let h = idle();

    let response = h.router.clone().oneshot(image_upload(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "MISSING_API_KEY");

    let response = h.router.clone().oneshot(status_request(None, "abc")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["code"], "MISSING_API_KEY");

    assert!(h.nothing_queued().await);
}

#[tokio::test]
async fn wrong_key_is_forbidden() {
    let h = idle();
    let response = h.router.clone().oneshot(image_upload(Some("nope"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], "INVALID_API_KEY");
    assert!(h.nothing_queued().await);
}

#[tokio::test]
async fn unconfigured_key_lets_requests_through() {
    let h = harness(
        ScriptedDetector::new(vec![Ok(vec![])]),
        HarnessOptions {
            api_key: None,
            ..HarnessOptions::default()
        },
    );
    let response = h.router.oneshot(image_upload(None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn upload_without_image_field() {
    let h = idle();

    let body = multipart_body("file", "photo.png", "image/png", &png_bytes());
    let response = h.router.clone().oneshot(upload_request(Some(API_KEY), body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "NO_IMAGE");

    let request = Request::builder()
        .method("POST")
        .uri("/api/detect/upload")
        .header("x-api-key", API_KEY)
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "NO_IMAGE");

    let body = multipart_body("image", "empty.png", "image/png", b"");
    let response = h.router.clone().oneshot(upload_request(Some(API_KEY), body)).await.unwrap();
    assert_eq!(json_body(response).await["code"], "NO_IMAGE");

    assert!(h.nothing_queued().await);
}

#[tokio::test]
async fn upload_of_non_image_type() {
    let h = idle();
    let body = multipart_body("image", "notes.txt", "text/plain", b"hello");
    let response = h.router.clone().oneshot(upload_request(Some(API_KEY), body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "INVALID_FILE_TYPE");
    assert!(h.nothing_queued().await);
}

#[tokio::test]
async fn unknown_and_missing_task_ids() {
    let h = idle();

    let response = h
        .router
        .clone()
        .oneshot(status_request(Some(API_KEY), "does-not-exist"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], "TASK_NOT_FOUND");

    let response = h.router.oneshot(status_request(Some(API_KEY), "")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "MISSING_TASK_ID");
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let h = idle();
    let response = h
        .router
        .oneshot(Request::builder().uri("/api/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["code"], "NOT_FOUND");
    assert_eq!(body["error"], "Not found");
}

#[tokio::test]
async fn rate_limit_rejects_after_max_requests() {
    let h = harness(
        ScriptedDetector::new(vec![Ok(vec![])]),
        HarnessOptions {
            max_requests: 2,
            ..HarnessOptions::default()
        },
    );

    for remaining in ["1", "0"] {
        let response = h
            .router
            .clone()
            .oneshot(status_request(Some(API_KEY), "x"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
    }

    let response = h
        .router
        .clone()
        .oneshot(status_request(Some(API_KEY), "x"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    let body = json_body(response).await;
    assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(body["error"], "Too many requests, please try again later");
    assert_eq!(body["retryAfter"], retry_after);

    // Rejected uploads never reach the service.
    let response = h.router.clone().oneshot(image_upload(Some(API_KEY))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(h.nothing_queued().await);
}

#[tokio::test]
async fn terminal_snapshots_are_stable() {
    let h = idle();
    let mut task = DetectionTask::pending("done", "uploads/done.jpg");
    task.transition(
        TaskStatus::Completed,
        Some(DetectionResult::from_persons(vec![DetectedPerson {
            age: 41.0,
            gender: Gender::Female,
            confidence: 0.7,
        }])),
        None,
        task.updated_at + 5,
    );
    h.tasks.save(&task).await.unwrap();

    let mut snapshots = Vec::new();
    for _ in 0..3 {
        let response = h
            .router
            .clone()
            .oneshot(status_request(Some(API_KEY), "done"))
            .await
            .unwrap();
        snapshots.push(json_body(response).await);
    }

    assert!(snapshots.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(snapshots[0]["status"], "completed");
    assert_eq!(snapshots[0]["result"]["count"], 1);
    assert_eq!(snapshots[0]["result"]["persons"][0]["gender"], "female");
}
