use super::*;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request};
use serde_json::Value;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    db: Db,
    uploads: tempfile::TempDir,
}

async fn test_app() -> TestApp {
    let uploads = tempfile::tempdir().unwrap();
    let config = Config {
        upload_dir: uploads.path().to_path_buf(),
        allowed_file_types: vec![DocumentType::Txt, DocumentType::Pdf],
        max_file_size: 1024,
        ..Config::default()
    };
    let db = Db::in_memory().await.unwrap();
    let state = AppState::new(config, db.clone(), Arc::new(extract::FileExtractor));
    TestApp {
        router: app_router(state),
        db,
        uploads,
    }
}

impl TestApp {
    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        self.dispatch(builder.body(body).unwrap()).await
    }

    async fn upload(&self, filename: &str, bytes: &'static [u8]) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/v1/documents/upload?filename={}", filename))
            .header("content-type", "application/octet-stream")
            .body(Body::from(bytes))
            .unwrap();
        self.dispatch(request).await
    }

    async fn dispatch(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    fn stored_files(&self) -> usize {
        std::fs::read_dir(self.uploads.path()).unwrap().count()
    }

    async fn create_card(&self) -> i64 {
        let (status, card) = self
            .send(
                Method::POST,
                "/api/v1/flashcards",
                Some(json!({ "front": "Capital of Peru?", "back": "Lima", "tags": ["geo"] })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        card["id"].as_i64().unwrap()
    }
}

#[tokio::test]
async fn health_and_root_respond() {
    let app = test_app().await;
    let (status, body) = app.send(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = app.send(Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn new_card_is_due_until_reviewed() {
    let app = test_app().await;
    let id = app.create_card().await;

    let (status, due) = app.send(Method::GET, "/api/v1/flashcards/due", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(due.as_array().unwrap().len(), 1);
    assert_eq!(due[0]["review_status"], "new");
    assert_eq!(due[0]["ease_factor"], 2.5);

    let (status, card) = app
        .send(
            Method::POST,
            &format!("/api/v1/flashcards/{}/review", id),
            Some(json!({ "score": 4, "time_spent": 12 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(card["interval"], 1);
    assert_eq!(card["repetitions"], 1);
    assert_eq!(card["total_reviews"], 1);
    assert_eq!(card["correct_reviews"], 1);
    assert_eq!(card["last_review_score"], 4);

    let (_, due) = app.send(Method::GET, "/api/v1/flashcards/due", None).await;
    assert!(due.as_array().unwrap().is_empty());

    let (status, stats) = app.send(Method::GET, "/api/v1/flashcards/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total"], 1);
    assert_eq!(stats["total_reviews"], 1);
    assert_eq!(stats["due"], 0);
}

#[tokio::test]
async fn out_of_range_scores_are_rejected() {
    let app = test_app().await;
    let id = app.create_card().await;

    for score in [0, 6, -1] {
        let (status, body) = app
            .send(
                Method::POST,
                &format!("/api/v1/flashcards/{}/review", id),
                Some(json!({ "score": score })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    let (_, card) = app
        .send(Method::GET, &format!("/api/v1/flashcards/{}", id), None)
        .await;
    assert_eq!(card["total_reviews"], 0);
    assert_eq!(card["review_status"], "new");
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let app = test_app().await;

    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/flashcards/999/review",
            Some(json!({ "score": 3 })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    for uri in [
        "/api/v1/flashcards/999",
        "/api/v1/documents/999",
        "/api/v1/knowledge-points/999",
        "/api/v1/exercises/999",
    ] {
        let (status, _) = app.send(Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
        let (status, _) = app.send(Method::DELETE, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
    }
}

#[tokio::test]
async fn blank_card_sides_are_rejected() {
    let app = test_app().await;
    let (status, body) = app
        .send(
            Method::POST,
            "/api/v1/flashcards",
            Some(json!({ "front": "  ", "back": "x" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "front must not be blank");

    let id = app.create_card().await;
    let (status, _) = app
        .send(
            Method::PUT,
            &format!("/api/v1/flashcards/{}", id),
            Some(json!({ "back": "" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn editing_a_card_keeps_its_schedule() {
    let app = test_app().await;
    let id = app.create_card().await;
    app.send(
        Method::POST,
        &format!("/api/v1/flashcards/{}/review", id),
        Some(json!({ "score": 5 })),
    )
    .await;

    let (status, card) = app
        .send(
            Method::PUT,
            &format!("/api/v1/flashcards/{}", id),
            Some(json!({ "back": "Lima, Peru", "notes": "coastal" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(card["back"], "Lima, Peru");
    assert_eq!(card["notes"], "coastal");
    assert_eq!(card["total_reviews"], 1);
    assert_eq!(card["interval"], 1);

    let (status, body) = app
        .send(Method::DELETE, &format!("/api/v1/flashcards/{}", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn text_upload_is_processed() {
    let app = test_app().await;
    let (status, doc) = app
        .upload("notes.txt", b"  Mitosis  \n\nCells divide into two.\n")
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(doc["document_type"], "txt");
    assert_eq!(doc["original_filename"], "notes.txt");
    assert_eq!(doc["title"], "notes.txt");
    assert_eq!(doc["processing_status"], "completed");
    assert_eq!(doc["processed_content"], "Mitosis\nCells divide into two.");
    assert!(doc.get("file_path").is_none());

    let (status, list) = app.send(Method::GET, "/api/v1/documents", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);
    assert_eq!(list["page"], 1);
    assert_eq!(list["documents"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn unreadable_upload_is_kept_as_failed() {
    let app = test_app().await;
    let (status, doc) = app.upload("slides.pdf", b"%PDF-1.4 binary").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(doc["processing_status"], "failed");
    assert!(doc["processing_error"].is_string());
}

#[tokio::test]
async fn disallowed_uploads_are_rejected() {
    let app = test_app().await;

    let (status, body) = app.upload("essay.docx", b"content").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let (status, _) = app.upload("archive.zip", b"content").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.upload("empty.txt", b"").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app.upload("big.txt", &[b'a'; 2048]).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "PAYLOAD_TOO_LARGE");

    let (_, list) = app.send(Method::GET, "/api/v1/documents", None).await;
    assert_eq!(list["total"], 0);
}

#[tokio::test]
async fn deleting_a_document_removes_it() {
    let app = test_app().await;
    let (_, doc) = app.upload("notes.txt", b"Osmosis").await;
    let id = doc["id"].as_i64().unwrap();

    let (status, _) = app
        .send(Method::DELETE, &format!("/api/v1/documents/{}", id), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = app
        .send(Method::GET, &format!("/api/v1/documents/{}", id), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn generation_needs_a_provider() {
    let app = test_app().await;
    let (_, doc) = app.upload("notes.txt", b"Osmosis moves water.").await;
    let doc_id = doc["id"].as_i64().unwrap();

    let (status, body) = app
        .send(
            Method::POST,
            &format!("/api/v1/documents/{}/summarize", doc_id),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "SERVICE_UNAVAILABLE");

    let (status, _) = app
        .send(
            Method::POST,
            "/api/v1/exercises/generate",
            Some(json!({ "topic": "osmosis" })),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (_, point) = app
        .send(
            Method::POST,
            "/api/v1/knowledge-points",
            Some(json!({ "title": "Osmosis" })),
        )
        .await;
    let (status, _) = app
        .send(
            Method::POST,
            &format!(
                "/api/v1/knowledge-points/{}/flashcards/generate",
                point["id"]
            ),
            Some(json!({ "count": 3 })),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn knowledge_points_crud() {
    let app = test_app().await;
    let (status, point) = app
        .send(
            Method::POST,
            "/api/v1/knowledge-points",
            Some(json!({ "title": "Diffusion", "category": "biology" })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(point["difficulty_level"], 1);
    let id = point["id"].as_i64().unwrap();

    let (status, _) = app
        .send(
            Method::PUT,
            &format!("/api/v1/knowledge-points/{}", id),
            Some(json!({ "mastery_level": 1.5 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, point) = app
        .send(
            Method::PUT,
            &format!("/api/v1/knowledge-points/{}", id),
            Some(json!({ "mastery_level": 0.5 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(point["mastery_level"], 0.5);

    let (_, list) = app
        .send(Method::GET, "/api/v1/knowledge-points?category=biology", None)
        .await;
    assert_eq!(list.as_array().unwrap().len(), 1);
    let (_, list) = app
        .send(Method::GET, "/api/v1/knowledge-points?category=history", None)
        .await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn card_with_missing_knowledge_point_is_rejected() {
    let app = test_app().await;
    let (status, _) = app
        .send(
            Method::POST,
            "/api/v1/flashcards",
            Some(json!({ "front": "Q", "back": "A", "knowledge_point_id": 42 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn exercise_submission_is_graded() {
    let app = test_app().await;
    let (status, exercise) = app
        .send(
            Method::POST,
            "/api/v1/exercises",
            Some(json!({
                "title": "Units",
                "question": "SI unit of force?",
                "exercise_type": "short_answer",
                "correct_answer": "Newton",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(exercise.get("correct_answer").is_none());
    assert_eq!(exercise["difficulty"], "intermediate");
    let id = exercise["id"].as_i64().unwrap();

    let (_, graded) = app
        .send(
            Method::PUT,
            &format!("/api/v1/exercises/{}/submit", id),
            Some(json!({ "user_answer": "joule" })),
        )
        .await;
    assert_eq!(graded["is_correct"], false);
    assert_eq!(graded["attempts"], 1);

    let (status, graded) = app
        .send(
            Method::PUT,
            &format!("/api/v1/exercises/{}/submit", id),
            Some(json!({ "user_answer": "  newton ", "time_spent": 30 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(graded["is_correct"], true);
    assert_eq!(graded["attempts"], 2);
    assert_eq!(graded["time_spent"], 30);
    assert!(graded["completed_at"].is_string());

    let (_, list) = app
        .send(Method::GET, "/api/v1/exercises?difficulty=advanced", None)
        .await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_requests_get_json_errors() {
    let app = test_app().await;
    let id = app.create_card().await;
    let review = format!("/api/v1/flashcards/{}/review", id);

    for body in [json!({}), json!({ "score": 4.0 }), json!({ "score": "good" })] {
        let (status, err) = app.send(Method::POST, &review, Some(body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
        assert_eq!(err["success"], false);
        assert_eq!(err["code"], "VALIDATION_ERROR");
        assert!(err["error"].is_string());
    }

    let request = Request::builder()
        .method(Method::POST)
        .uri(&review)
        .header("content-type", "application/json")
        .body(Body::from("{\"score\": 4"))
        .unwrap();
    let (status, err) = app.dispatch(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "VALIDATION_ERROR");

    for uri in [
        "/api/v1/exercises?difficulty=hard",
        "/api/v1/flashcards?limit=many",
        "/api/v1/flashcards/abc",
        "/api/v1/documents/upload",
    ] {
        let method = if uri.ends_with("upload") { Method::POST } else { Method::GET };
        let (status, err) = app.send(method, uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(err["code"], "VALIDATION_ERROR", "{}", uri);
    }

    let (_, card) = app.send(Method::GET, &format!("/api/v1/flashcards/{}", id), None).await;
    assert_eq!(card["total_reviews"], 0);
}

#[tokio::test]
async fn failed_upload_leaves_no_file_behind() {
    let app = test_app().await;
    app.db.close().await;

    let (status, body) = app.upload("notes.txt", b"Osmosis moves water.").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "INTERNAL_ERROR");
    assert_eq!(app.stored_files(), 0);
}

#[tokio::test]
async fn successful_upload_keeps_its_file() {
    let app = test_app().await;
    let (status, _) = app.upload("notes.txt", b"Osmosis moves water.").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(app.stored_files(), 1);
}
