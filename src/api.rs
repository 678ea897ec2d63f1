use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, FromRequest, FromRequestParts, State},
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::config::Config;
use crate::db::{Db, Page};
use crate::error::{AppError, AppResult};
use crate::extract::{self, TextExtractor};
use crate::grading;
use crate::llm::LlmClient;
use crate::models::{
    CardType, Difficulty, Document, DocumentPatch, DocumentType, Exercise, ExercisePatch,
    ExerciseType, Flashcard, FlashcardPatch, KnowledgePoint, KnowledgePointPatch, NewDocument,
    NewExercise, NewFlashcard, NewKnowledgePoint,
};
use crate::review::ReviewService;

/// Cap on how much document text is sent to the generation provider.
const MAX_PROMPT_CHARS: usize = 12_000;
const SUMMARY_LENGTH: usize = 500;

/// JSON body whose rejections use the API error format.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
struct JsonBody<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
struct QueryParams<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(AppError))]
struct PathParam<T>(T);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Db,
    pub reviews: ReviewService,
    pub extractor: Arc<dyn TextExtractor>,
    pub llm: Option<LlmClient>,
}

impl AppState {
    pub fn new(config: Config, db: Db, extractor: Arc<dyn TextExtractor>) -> Self {
        let llm = config.llm.clone().map(LlmClient::new);
        if llm.is_none() {
            log::info!("OPENAI_API_KEY not set, generation endpoints disabled");
        }
        Self {
            config: Arc::new(config),
            reviews: ReviewService::new(db.clone()),
            db,
            extractor,
            llm,
        }
    }

    fn llm(&self) -> AppResult<&LlmClient> {
        self.llm
            .as_ref()
            .ok_or_else(|| AppError::unavailable("content generation is not configured"))
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn app_router(state: AppState) -> Router {
    let upload_limit = usize::try_from(state.config.max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(1);

    let api = Router::new()
        .route("/flashcards", post(create_flashcard).get(list_flashcards))
        .route("/flashcards/due", get(due_flashcards))
        .route("/flashcards/stats", get(flashcard_stats))
        .route(
            "/flashcards/:id",
            get(get_flashcard).put(update_flashcard).delete(delete_flashcard),
        )
        .route("/flashcards/:id/review", post(review_flashcard))
        .route(
            "/documents/upload",
            post(upload_document).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/documents", get(list_documents))
        .route(
            "/documents/:id",
            get(get_document).put(update_document).delete(delete_document),
        )
        .route("/documents/:id/summarize", post(summarize_document))
        .route(
            "/documents/:id/knowledge-points/generate",
            post(generate_knowledge_points),
        )
        .route(
            "/knowledge-points",
            post(create_knowledge_point).get(list_knowledge_points),
        )
        .route(
            "/knowledge-points/:id",
            get(get_knowledge_point)
                .put(update_knowledge_point)
                .delete(delete_knowledge_point),
        )
        .route(
            "/knowledge-points/:id/flashcards/generate",
            post(generate_flashcards),
        )
        .route("/exercises", post(create_exercise).get(list_exercises))
        .route("/exercises/generate", post(generate_exercises))
        .route(
            "/exercises/:id",
            get(get_exercise).put(update_exercise).delete(delete_exercise),
        )
        .route("/exercises/:id/submit", put(submit_exercise));

    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(cors)
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "message": "Study Assistant API",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

fn deleted(what: &str) -> Json<serde_json::Value> {
    Json(json!({ "message": format!("{} deleted successfully", what) }))
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    skip: Option<i64>,
    limit: Option<i64>,
    #[serde(default)]
    due_only: bool,
    category: Option<String>,
    difficulty: Option<Difficulty>,
}

impl ListQuery {
    fn page(&self) -> Page {
        let defaults = Page::default();
        Page {
            skip: self.skip.unwrap_or(defaults.skip).max(0),
            limit: self.limit.unwrap_or(defaults.limit).clamp(1, 1000),
        }
    }
}

// --- Flashcards ---

async fn create_flashcard(
    State(state): State<AppState>,
    JsonBody(new): JsonBody<NewFlashcard>,
) -> AppResult<(StatusCode, Json<Flashcard>)> {
    new.validate()?;
    let card = state.db.insert_flashcard(&new, Utc::now()).await?;
    log::info!("created flashcard {}", card.id);
    Ok((StatusCode::CREATED, Json(card)))
}

async fn list_flashcards(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<ListQuery>,
) -> AppResult<Json<Vec<Flashcard>>> {
    let due_by = query.due_only.then(Utc::now);
    let cards = state.db.list_flashcards(query.page(), due_by).await?;
    Ok(Json(cards))
}

async fn due_flashcards(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<ListQuery>,
) -> AppResult<Json<Vec<Flashcard>>> {
    let cards = state.reviews.due(Utc::now(), query.page().limit).await?;
    Ok(Json(cards))
}

async fn flashcard_stats(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let stats = state.reviews.stats(Utc::now()).await?;
    Ok(Json(stats))
}

async fn load_flashcard(state: &AppState, id: i64) -> AppResult<Flashcard> {
    state
        .db
        .get_flashcard(id)
        .await?
        .ok_or_else(|| AppError::not_found("Flashcard not found"))
}

async fn get_flashcard(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> AppResult<Json<Flashcard>> {
    Ok(Json(load_flashcard(&state, id).await?))
}

async fn update_flashcard(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
    JsonBody(patch): JsonBody<FlashcardPatch>,
) -> AppResult<Json<Flashcard>> {
    let mut card = load_flashcard(&state, id).await?;
    patch.apply(&mut card)?;

    let now = Utc::now();
    if !state.db.update_flashcard(&card, now).await? {
        return Err(AppError::not_found("Flashcard not found"));
    }
    card.updated_at = Some(now);
    Ok(Json(card))
}

async fn delete_flashcard(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> AppResult<impl IntoResponse> {
    if !state.db.delete_flashcard(id).await? {
        return Err(AppError::not_found("Flashcard not found"));
    }
    Ok(deleted("Flashcard"))
}

#[derive(Debug, Deserialize)]
struct ReviewRequest {
    score: i64,
    time_spent: Option<i64>,
}

async fn review_flashcard(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
    JsonBody(payload): JsonBody<ReviewRequest>,
) -> AppResult<Json<Flashcard>> {
    let card = state.reviews.review(id, payload.score, Utc::now()).await?;
    if let Some(seconds) = payload.time_spent {
        log::debug!("flashcard {} answered in {}s", id, seconds);
    }
    Ok(Json(card))
}

// --- Documents ---

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: String,
    title: Option<String>,
}

async fn upload_document(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<UploadQuery>,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<(StatusCode, Json<Document>)> {
    let body = body?;
    let original = query.filename.trim().to_string();
    let kind = DocumentType::from_filename(&original)
        .filter(|kind| state.config.accepts(*kind))
        .ok_or_else(|| AppError::validation(format!("File type of '{}' not allowed", original)))?;

    if body.len() as u64 > state.config.max_file_size {
        return Err(AppError::payload_too_large("File too large"));
    }
    if body.is_empty() {
        return Err(AppError::validation("File is empty"));
    }

    let stored_name = format!("{}.{}", Uuid::new_v4(), kind);
    let dir = &state.config.upload_dir;
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(&stored_name);
    tokio::fs::write(&path, &body).await?;

    let new = NewDocument {
        title: query.title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| original.clone()),
        filename: stored_name,
        original_filename: original,
        file_path: path.display().to_string(),
        file_size: body.len() as i64,
        document_type: kind,
    };

    match register_upload(&state, &new).await {
        Ok(doc) => Ok((StatusCode::CREATED, Json(doc))),
        Err(err) => {
            if let Err(io) = tokio::fs::remove_file(&path).await {
                log::warn!("could not remove orphaned upload {}: {}", path.display(), io);
            }
            Err(err)
        }
    }
}

/// Records a stored upload and runs text extraction on it.
async fn register_upload(state: &AppState, new: &NewDocument) -> AppResult<Document> {
    let now = Utc::now();
    let mut doc = state.db.insert_document(new, now).await?;
    log::info!("stored upload {} as document {}", new.original_filename, doc.id);

    extract::process_document(Arc::clone(&state.extractor), &mut doc, now).await;
    if !state.db.update_document(&doc, now).await? {
        return Err(AppError::not_found("Document not found"));
    }
    doc.updated_at = Some(now);
    Ok(doc)
}

#[derive(Debug, Serialize)]
struct DocumentList {
    documents: Vec<Document>,
    total: i64,
    page: i64,
    size: i64,
}

async fn list_documents(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<ListQuery>,
) -> AppResult<Json<DocumentList>> {
    let page = query.page();
    let (documents, total) = state.db.list_documents(page).await?;
    Ok(Json(DocumentList {
        documents,
        total,
        page: page.skip / page.limit + 1,
        size: page.limit,
    }))
}

async fn load_document(state: &AppState, id: i64) -> AppResult<Document> {
    state
        .db
        .get_document(id)
        .await?
        .ok_or_else(|| AppError::not_found("Document not found"))
}

async fn get_document(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> AppResult<Json<Document>> {
    Ok(Json(load_document(&state, id).await?))
}

async fn update_document(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
    JsonBody(patch): JsonBody<DocumentPatch>,
) -> AppResult<Json<Document>> {
    let mut doc = load_document(&state, id).await?;
    patch.apply(&mut doc)?;

    let now = Utc::now();
    if !state.db.update_document(&doc, now).await? {
        return Err(AppError::not_found("Document not found"));
    }
    doc.updated_at = Some(now);
    Ok(Json(doc))
}

async fn delete_document(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> AppResult<impl IntoResponse> {
    let doc = load_document(&state, id).await?;

    match tokio::fs::remove_file(&doc.file_path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::warn!("stored file for document {} already gone", id);
        }
        Err(err) => return Err(err.into()),
    }

    state.db.delete_document(id).await?;
    Ok(deleted("Document"))
}

fn document_text(doc: &Document) -> AppResult<String> {
    let text = doc
        .processed_content
        .as_deref()
        .filter(|text| !text.is_empty())
        .ok_or_else(|| AppError::validation("Document has no extracted text"))?;
    Ok(text.chars().take(MAX_PROMPT_CHARS).collect())
}

async fn summarize_document(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> AppResult<Json<Document>> {
    let llm = state.llm()?;
    let mut doc = load_document(&state, id).await?;
    let text = document_text(&doc)?;

    doc.summary = Some(llm.summarize(&text, SUMMARY_LENGTH).await?);

    let now = Utc::now();
    if !state.db.update_document(&doc, now).await? {
        return Err(AppError::not_found("Document not found"));
    }
    doc.updated_at = Some(now);
    Ok(Json(doc))
}

async fn generate_knowledge_points(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> AppResult<(StatusCode, Json<Vec<KnowledgePoint>>)> {
    let llm = state.llm()?;
    let doc = load_document(&state, id).await?;
    let text = document_text(&doc)?;

    let generated = llm.extract_knowledge_points(&text).await?;
    let now = Utc::now();
    let mut created = Vec::with_capacity(generated.len());
    for item in generated {
        let new = NewKnowledgePoint {
            title: item.title,
            description: item.description,
            content: None,
            category: item.category,
            difficulty_level: 1,
            document_id: Some(doc.id),
            tags: Vec::new(),
        };
        if new.validate().is_err() {
            log::warn!("skipping generated knowledge point without a title");
            continue;
        }
        created.push(state.db.insert_knowledge_point(&new, now).await?);
    }

    log::info!("generated {} knowledge points for document {}", created.len(), id);
    Ok((StatusCode::CREATED, Json(created)))
}

// --- Knowledge points ---

async fn create_knowledge_point(
    State(state): State<AppState>,
    JsonBody(new): JsonBody<NewKnowledgePoint>,
) -> AppResult<(StatusCode, Json<KnowledgePoint>)> {
    new.validate()?;
    let point = state.db.insert_knowledge_point(&new, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(point)))
}

async fn list_knowledge_points(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<ListQuery>,
) -> AppResult<Json<Vec<KnowledgePoint>>> {
    let points = state
        .db
        .list_knowledge_points(query.page(), query.category.as_deref())
        .await?;
    Ok(Json(points))
}

async fn load_knowledge_point(state: &AppState, id: i64) -> AppResult<KnowledgePoint> {
    state
        .db
        .get_knowledge_point(id)
        .await?
        .ok_or_else(|| AppError::not_found("Knowledge point not found"))
}

async fn get_knowledge_point(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> AppResult<Json<KnowledgePoint>> {
    Ok(Json(load_knowledge_point(&state, id).await?))
}

async fn update_knowledge_point(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
    JsonBody(patch): JsonBody<KnowledgePointPatch>,
) -> AppResult<Json<KnowledgePoint>> {
    let mut point = load_knowledge_point(&state, id).await?;
    patch.apply(&mut point)?;

    let now = Utc::now();
    if !state.db.update_knowledge_point(&point, now).await? {
        return Err(AppError::not_found("Knowledge point not found"));
    }
    point.updated_at = Some(now);
    Ok(Json(point))
}

async fn delete_knowledge_point(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> AppResult<impl IntoResponse> {
    if !state.db.delete_knowledge_point(id).await? {
        return Err(AppError::not_found("Knowledge point not found"));
    }
    Ok(deleted("Knowledge point"))
}

#[derive(Debug, Default, Deserialize)]
struct GenerateFlashcardsRequest {
    count: Option<u32>,
}

async fn generate_flashcards(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
    payload: Option<JsonBody<GenerateFlashcardsRequest>>,
) -> AppResult<(StatusCode, Json<Vec<Flashcard>>)> {
    let llm = state.llm()?;
    let point = load_knowledge_point(&state, id).await?;
    let count = payload
        .and_then(|JsonBody(req)| req.count)
        .unwrap_or(5)
        .clamp(1, 20);

    let topic = match &point.description {
        Some(description) => format!("{}: {}", point.title, description),
        None => point.title.clone(),
    };

    let generated = llm.generate_flashcards(&topic, count).await?;
    let now = Utc::now();
    let mut created = Vec::with_capacity(generated.len());
    for item in generated {
        let new = NewFlashcard {
            front: item.front,
            back: item.back,
            card_type: CardType::Basic,
            knowledge_point_id: Some(point.id),
            tags: point.tags.clone(),
            options: None,
        };
        if new.validate().is_err() {
            log::warn!("skipping generated flashcard with blank side");
            continue;
        }
        created.push(state.db.insert_flashcard(&new, now).await?);
    }

    Ok((StatusCode::CREATED, Json(created)))
}

// --- Exercises ---

async fn create_exercise(
    State(state): State<AppState>,
    JsonBody(new): JsonBody<NewExercise>,
) -> AppResult<(StatusCode, Json<Exercise>)> {
    new.validate()?;
    let exercise = state.db.insert_exercise(&new, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(exercise)))
}

async fn list_exercises(
    State(state): State<AppState>,
    QueryParams(query): QueryParams<ListQuery>,
) -> AppResult<Json<Vec<Exercise>>> {
    let exercises = state
        .db
        .list_exercises(query.page(), query.category.as_deref(), query.difficulty)
        .await?;
    Ok(Json(exercises))
}

async fn load_exercise(state: &AppState, id: i64) -> AppResult<Exercise> {
    state
        .db
        .get_exercise(id)
        .await?
        .ok_or_else(|| AppError::not_found("Exercise not found"))
}

async fn get_exercise(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> AppResult<Json<Exercise>> {
    Ok(Json(load_exercise(&state, id).await?))
}

async fn update_exercise(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
    JsonBody(patch): JsonBody<ExercisePatch>,
) -> AppResult<Json<Exercise>> {
    let mut exercise = load_exercise(&state, id).await?;
    patch.apply(&mut exercise)?;

    let now = Utc::now();
    if !state.db.update_exercise(&exercise, now).await? {
        return Err(AppError::not_found("Exercise not found"));
    }
    exercise.updated_at = Some(now);
    Ok(Json(exercise))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    user_answer: String,
    time_spent: Option<i64>,
}

async fn submit_exercise(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
    JsonBody(payload): JsonBody<SubmitRequest>,
) -> AppResult<Json<Exercise>> {
    let mut exercise = load_exercise(&state, id).await?;

    let now = Utc::now();
    grading::submit(&mut exercise, payload.user_answer, payload.time_spent, now);
    if !state.db.update_exercise(&exercise, now).await? {
        return Err(AppError::not_found("Exercise not found"));
    }
    exercise.updated_at = Some(now);
    Ok(Json(exercise))
}

async fn delete_exercise(
    State(state): State<AppState>,
    PathParam(id): PathParam<i64>,
) -> AppResult<impl IntoResponse> {
    if !state.db.delete_exercise(id).await? {
        return Err(AppError::not_found("Exercise not found"));
    }
    Ok(deleted("Exercise"))
}

#[derive(Debug, Deserialize)]
struct GenerateExercisesRequest {
    topic: String,
    #[serde(default)]
    difficulty: Difficulty,
    count: Option<u32>,
    category: Option<String>,
}

async fn generate_exercises(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<GenerateExercisesRequest>,
) -> AppResult<(StatusCode, Json<Vec<Exercise>>)> {
    if payload.topic.trim().is_empty() {
        return Err(AppError::validation("topic must not be blank"));
    }
    let llm = state.llm()?;
    let count = payload.count.unwrap_or(3).clamp(1, 10);

    let generated = llm
        .generate_exercises(&payload.topic, payload.difficulty, count)
        .await?;

    let now = Utc::now();
    let mut created = Vec::with_capacity(generated.len());
    for (n, item) in generated.into_iter().enumerate() {
        let exercise_type = if item.options.is_some() {
            ExerciseType::MultipleChoice
        } else {
            ExerciseType::ShortAnswer
        };
        let new = NewExercise {
            title: format!("{} #{}", payload.topic.trim(), n + 1),
            question: item.question,
            exercise_type,
            difficulty: payload.difficulty,
            options: item.options,
            correct_answer: item.correct_answer,
            explanation: item.explanation,
            hints: Vec::new(),
            tags: Vec::new(),
            category: payload.category.clone(),
            source: Some("llm".to_string()),
        };
        if new.validate().is_err() {
            log::warn!("skipping generated exercise without a question");
            continue;
        }
        created.push(state.db.insert_exercise(&new, now).await?);
    }

    Ok((StatusCode::CREATED, Json(created)))
}

#[cfg(test)]
#[path = "api_tests.rs"]
mod tests;
