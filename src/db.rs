use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteQueryResult, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{ConnectOptions, FromRow, Pool, Row, Sqlite};
use std::str::FromStr;
use thiserror::Error;

use crate::models::{
    Difficulty, Document, Exercise, Flashcard, KnowledgePoint, ModelError, NewDocument,
    NewExercise, NewFlashcard, NewKnowledgePoint,
};
use crate::srs::{ReviewRecord, ReviewState};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{0} {1} not found")]
    NotFound(&'static str, i64),
    #[error("referenced record does not exist")]
    InvalidReference,
    #[error(transparent)]
    Sqlx(sqlx::Error),
    #[error("failed to encode column: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => DbError::InvalidReference,
            _ => DbError::Sqlx(err),
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Offset pagination shared by the list endpoints.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub skip: i64,
    pub limit: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self { skip: 0, limit: 100 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlashcardStats {
    pub total: i64,
    pub due: i64,
    pub new: i64,
    pub learning: i64,
    pub review: i64,
    pub relearning: i64,
    pub total_reviews: i64,
    pub correct_reviews: i64,
    pub accuracy: f64,
}

fn decode_err(err: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

fn enum_column<T: FromStr<Err = ModelError>>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(decode_err)
}

fn json_column<T: DeserializeOwned + Default>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error> {
    let raw: Option<String> = row.try_get(column)?;
    match raw {
        Some(text) if !text.is_empty() => serde_json::from_str(&text).map_err(decode_err),
        _ => Ok(T::default()),
    }
}

fn to_json<T: Serialize>(value: &T) -> DbResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn to_json_opt(value: &Option<serde_json::Value>) -> DbResult<Option<String>> {
    value.as_ref().map(to_json).transpose()
}

impl<'r> FromRow<'r, SqliteRow> for Flashcard {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let review = ReviewState::restore(ReviewRecord {
            ease_factor: row.try_get("ease_factor")?,
            interval: row.try_get("interval")?,
            repetitions: row.try_get("repetitions")?,
            review_status: enum_column(row, "review_status")?,
            total_reviews: row.try_get("total_reviews")?,
            correct_reviews: row.try_get("correct_reviews")?,
            last_review_score: row.try_get("last_review_score")?,
            due_date: row.try_get("due_date")?,
            last_reviewed: row.try_get("last_reviewed")?,
        })
        .map_err(decode_err)?;

        Ok(Flashcard {
            id: row.try_get("id")?,
            front: row.try_get("front")?,
            back: row.try_get("back")?,
            card_type: enum_column(row, "card_type")?,
            options: json_column(row, "options")?,
            review,
            tags: json_column(row, "tags")?,
            notes: row.try_get("notes")?,
            knowledge_point_id: row.try_get("knowledge_point_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Document {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Document {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            filename: row.try_get("filename")?,
            original_filename: row.try_get("original_filename")?,
            file_path: row.try_get("file_path")?,
            file_size: row.try_get("file_size")?,
            document_type: enum_column(row, "document_type")?,
            processing_status: enum_column(row, "processing_status")?,
            processing_error: row.try_get("processing_error")?,
            raw_content: row.try_get("raw_content")?,
            processed_content: row.try_get("processed_content")?,
            summary: row.try_get("summary")?,
            language: row.try_get("language")?,
            page_count: row.try_get("page_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for KnowledgePoint {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(KnowledgePoint {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            content: row.try_get("content")?,
            mastery_level: row.try_get("mastery_level")?,
            times_reviewed: row.try_get("times_reviewed")?,
            last_reviewed: row.try_get("last_reviewed")?,
            category: row.try_get("category")?,
            tags: json_column(row, "tags")?,
            difficulty_level: row.try_get("difficulty_level")?,
            document_id: row.try_get("document_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, SqliteRow> for Exercise {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Exercise {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            question: row.try_get("question")?,
            exercise_type: enum_column(row, "exercise_type")?,
            difficulty: enum_column(row, "difficulty")?,
            options: json_column(row, "options")?,
            correct_answer: row.try_get("correct_answer")?,
            explanation: row.try_get("explanation")?,
            hints: json_column(row, "hints")?,
            user_answer: row.try_get("user_answer")?,
            is_correct: row.try_get("is_correct")?,
            attempts: row.try_get("attempts")?,
            time_spent: row.try_get("time_spent")?,
            tags: json_column(row, "tags")?,
            category: row.try_get("category")?,
            source: row.try_get("source")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

fn found(result: SqliteQueryResult) -> bool {
    result.rows_affected() > 0
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .log_statements(log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let db = Db { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database. A single connection that never expires,
    /// since each SQLite memory connection is its own database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .log_statements(log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Db { pool };
        db.migrate().await?;
        Ok(db)
    }

    #[cfg(test)]
    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                filename TEXT NOT NULL,
                original_filename TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_size INTEGER NOT NULL DEFAULT 0,
                document_type TEXT NOT NULL,
                processing_status TEXT NOT NULL DEFAULT 'pending',
                processing_error TEXT,
                raw_content TEXT,
                processed_content TEXT,
                summary TEXT,
                language TEXT,
                page_count INTEGER,
                created_at DATETIME NOT NULL,
                updated_at DATETIME,
                processed_at DATETIME
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS knowledge_points (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT,
                content TEXT,
                mastery_level REAL NOT NULL DEFAULT 0.0,
                times_reviewed INTEGER NOT NULL DEFAULT 0,
                last_reviewed DATETIME,
                category TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                difficulty_level INTEGER NOT NULL DEFAULT 1,
                document_id INTEGER REFERENCES documents(id) ON DELETE SET NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS flashcards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                front TEXT NOT NULL,
                back TEXT NOT NULL,
                card_type TEXT NOT NULL DEFAULT 'basic',
                options TEXT,
                ease_factor REAL NOT NULL DEFAULT 2.5,
                interval INTEGER NOT NULL DEFAULT 1,
                repetitions INTEGER NOT NULL DEFAULT 0,
                review_status TEXT NOT NULL DEFAULT 'new',
                total_reviews INTEGER NOT NULL DEFAULT 0,
                correct_reviews INTEGER NOT NULL DEFAULT 0,
                last_review_score INTEGER,
                due_date DATETIME NOT NULL,
                last_reviewed DATETIME,
                tags TEXT NOT NULL DEFAULT '[]',
                notes TEXT,
                knowledge_point_id INTEGER REFERENCES knowledge_points(id) ON DELETE SET NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME
            );
            "#,
            "CREATE INDEX IF NOT EXISTS idx_flashcards_due ON flashcards (due_date);",
            r#"
            CREATE TABLE IF NOT EXISTS exercises (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                question TEXT NOT NULL,
                exercise_type TEXT NOT NULL,
                difficulty TEXT NOT NULL DEFAULT 'intermediate',
                options TEXT,
                correct_answer TEXT,
                explanation TEXT,
                hints TEXT NOT NULL DEFAULT '[]',
                user_answer TEXT,
                is_correct BOOLEAN,
                attempts INTEGER NOT NULL DEFAULT 0,
                time_spent INTEGER,
                tags TEXT NOT NULL DEFAULT '[]',
                category TEXT,
                source TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME,
                completed_at DATETIME
            );
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // --- Flashcards ---

    pub async fn insert_flashcard(&self, new: &NewFlashcard, now: DateTime<Utc>) -> DbResult<Flashcard> {
        let review = ReviewState::new(now);
        let result = sqlx::query(
            r#"
            INSERT INTO flashcards
                (front, back, card_type, options, ease_factor, interval, repetitions, review_status,
                 total_reviews, correct_reviews, due_date, tags, knowledge_point_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.front)
        .bind(&new.back)
        .bind(new.card_type.as_str())
        .bind(to_json_opt(&new.options)?)
        .bind(review.ease_factor())
        .bind(i64::from(review.interval()))
        .bind(i64::from(review.repetitions()))
        .bind(review.review_status().as_str())
        .bind(review.due_date())
        .bind(to_json(&new.tags)?)
        .bind(new.knowledge_point_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Flashcard {
            id: result.last_insert_rowid(),
            front: new.front.clone(),
            back: new.back.clone(),
            card_type: new.card_type,
            options: new.options.clone(),
            review,
            tags: new.tags.clone(),
            notes: None,
            knowledge_point_id: new.knowledge_point_id,
            created_at: now,
            updated_at: None,
        })
    }

    pub async fn get_flashcard(&self, id: i64) -> DbResult<Option<Flashcard>> {
        let card = sqlx::query_as::<_, Flashcard>("SELECT * FROM flashcards WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(card)
    }

    pub async fn list_flashcards(&self, page: Page, due_by: Option<DateTime<Utc>>) -> DbResult<Vec<Flashcard>> {
        let cards = match due_by {
            Some(now) => {
                sqlx::query_as::<_, Flashcard>(
                    r#"
                    SELECT * FROM flashcards
                    WHERE julianday(due_date) <= julianday(?)
                    ORDER BY julianday(due_date) ASC, id ASC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(now)
                .bind(page.limit)
                .bind(page.skip)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Flashcard>("SELECT * FROM flashcards ORDER BY id LIMIT ? OFFSET ?")
                    .bind(page.limit)
                    .bind(page.skip)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(cards)
    }

    /// Writes the user-editable fields of a card.
    pub async fn update_flashcard(&self, card: &Flashcard, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE flashcards SET front = ?, back = ?, tags = ?, notes = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&card.front)
        .bind(&card.back)
        .bind(to_json(&card.tags)?)
        .bind(&card.notes)
        .bind(now)
        .bind(card.id)
        .execute(&self.pool)
        .await?;
        Ok(found(result))
    }

    /// Persists the review state of `card`, but only if the stored row still
    /// has `expected_total_reviews`. Returns false when another review got
    /// there first (or the card is gone).
    pub async fn save_review(
        &self,
        card: &Flashcard,
        expected_total_reviews: u32,
        now: DateTime<Utc>,
    ) -> DbResult<bool> {
        let review = &card.review;
        let result = sqlx::query(
            r#"
            UPDATE flashcards SET
                ease_factor = ?, interval = ?, repetitions = ?, review_status = ?,
                total_reviews = ?, correct_reviews = ?, last_review_score = ?,
                due_date = ?, last_reviewed = ?, updated_at = ?
            WHERE id = ? AND total_reviews = ?
            "#,
        )
        .bind(review.ease_factor())
        .bind(i64::from(review.interval()))
        .bind(i64::from(review.repetitions()))
        .bind(review.review_status().as_str())
        .bind(i64::from(review.total_reviews()))
        .bind(i64::from(review.correct_reviews()))
        .bind(review.last_review_score().map(i64::from))
        .bind(review.due_date())
        .bind(review.last_reviewed())
        .bind(now)
        .bind(card.id)
        .bind(i64::from(expected_total_reviews))
        .execute(&self.pool)
        .await?;
        Ok(found(result))
    }

    pub async fn delete_flashcard(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM flashcards WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(found(result))
    }

    pub async fn flashcard_stats(&self, now: DateTime<Utc>) -> DbResult<FlashcardStats> {
        let mut stats = FlashcardStats::default();

        let rows = sqlx::query(
            "SELECT review_status, COUNT(*) AS n FROM flashcards GROUP BY review_status",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let status: String = row.try_get("review_status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "new" => stats.new = n,
                "learning" => stats.learning = n,
                "review" => stats.review = n,
                "relearning" => stats.relearning = n,
                other => log::warn!("unexpected review status in store: {}", other),
            }
            stats.total += n;
        }

        stats.due = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM flashcards WHERE julianday(due_date) <= julianday(?)",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(total_reviews), 0) AS total_reviews,
                   COALESCE(SUM(correct_reviews), 0) AS correct_reviews
            FROM flashcards
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        stats.total_reviews = row.try_get("total_reviews")?;
        stats.correct_reviews = row.try_get("correct_reviews")?;
        if stats.total_reviews > 0 {
            stats.accuracy = stats.correct_reviews as f64 / stats.total_reviews as f64;
        }

        Ok(stats)
    }

    // --- Documents ---

    pub async fn insert_document(&self, new: &NewDocument, now: DateTime<Utc>) -> DbResult<Document> {
        let result = sqlx::query(
            r#"
            INSERT INTO documents
                (title, filename, original_filename, file_path, file_size, document_type,
                 processing_status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(&new.title)
        .bind(&new.filename)
        .bind(&new.original_filename)
        .bind(&new.file_path)
        .bind(new.file_size)
        .bind(new.document_type.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_document(id)
            .await?
            .ok_or(DbError::NotFound("document", id))
    }

    pub async fn get_document(&self, id: i64) -> DbResult<Option<Document>> {
        let doc = sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(doc)
    }

    pub async fn list_documents(&self, page: Page) -> DbResult<(Vec<Document>, i64)> {
        let docs = sqlx::query_as::<_, Document>("SELECT * FROM documents ORDER BY id LIMIT ? OFFSET ?")
            .bind(page.limit)
            .bind(page.skip)
            .fetch_all(&self.pool)
            .await?;
        let total: i64 = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok((docs, total))
    }

    pub async fn update_document(&self, doc: &Document, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE documents SET
                title = ?, processing_status = ?, processing_error = ?, raw_content = ?,
                processed_content = ?, summary = ?, language = ?, page_count = ?,
                processed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&doc.title)
        .bind(doc.processing_status.as_str())
        .bind(&doc.processing_error)
        .bind(&doc.raw_content)
        .bind(&doc.processed_content)
        .bind(&doc.summary)
        .bind(&doc.language)
        .bind(doc.page_count)
        .bind(doc.processed_at)
        .bind(now)
        .bind(doc.id)
        .execute(&self.pool)
        .await?;
        Ok(found(result))
    }

    pub async fn delete_document(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(found(result))
    }

    // --- Knowledge points ---

    pub async fn insert_knowledge_point(
        &self,
        new: &NewKnowledgePoint,
        now: DateTime<Utc>,
    ) -> DbResult<KnowledgePoint> {
        let result = sqlx::query(
            r#"
            INSERT INTO knowledge_points
                (title, description, content, category, tags, difficulty_level, document_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.title)
        .bind(&new.description)
        .bind(&new.content)
        .bind(&new.category)
        .bind(to_json(&new.tags)?)
        .bind(new.difficulty_level)
        .bind(new.document_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_knowledge_point(id)
            .await?
            .ok_or(DbError::NotFound("knowledge point", id))
    }

    pub async fn get_knowledge_point(&self, id: i64) -> DbResult<Option<KnowledgePoint>> {
        let point = sqlx::query_as::<_, KnowledgePoint>("SELECT * FROM knowledge_points WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(point)
    }

    pub async fn list_knowledge_points(
        &self,
        page: Page,
        category: Option<&str>,
    ) -> DbResult<Vec<KnowledgePoint>> {
        let points = sqlx::query_as::<_, KnowledgePoint>(
            r#"
            SELECT * FROM knowledge_points
            WHERE (?1 IS NULL OR category = ?1)
            ORDER BY id LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(category)
        .bind(page.limit)
        .bind(page.skip)
        .fetch_all(&self.pool)
        .await?;
        Ok(points)
    }

    pub async fn update_knowledge_point(&self, point: &KnowledgePoint, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE knowledge_points SET
                title = ?, description = ?, content = ?, mastery_level = ?, category = ?,
                tags = ?, difficulty_level = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&point.title)
        .bind(&point.description)
        .bind(&point.content)
        .bind(point.mastery_level)
        .bind(&point.category)
        .bind(to_json(&point.tags)?)
        .bind(point.difficulty_level)
        .bind(now)
        .bind(point.id)
        .execute(&self.pool)
        .await?;
        Ok(found(result))
    }

    pub async fn delete_knowledge_point(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM knowledge_points WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(found(result))
    }

    // --- Exercises ---

    pub async fn insert_exercise(&self, new: &NewExercise, now: DateTime<Utc>) -> DbResult<Exercise> {
        let result = sqlx::query(
            r#"
            INSERT INTO exercises
                (title, question, exercise_type, difficulty, options, correct_answer, explanation,
                 hints, tags, category, source, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.title)
        .bind(&new.question)
        .bind(new.exercise_type.as_str())
        .bind(new.difficulty.as_str())
        .bind(to_json_opt(&new.options)?)
        .bind(&new.correct_answer)
        .bind(&new.explanation)
        .bind(to_json(&new.hints)?)
        .bind(to_json(&new.tags)?)
        .bind(&new.category)
        .bind(&new.source)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.get_exercise(id)
            .await?
            .ok_or(DbError::NotFound("exercise", id))
    }

    pub async fn get_exercise(&self, id: i64) -> DbResult<Option<Exercise>> {
        let exercise = sqlx::query_as::<_, Exercise>("SELECT * FROM exercises WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(exercise)
    }

    pub async fn list_exercises(
        &self,
        page: Page,
        category: Option<&str>,
        difficulty: Option<Difficulty>,
    ) -> DbResult<Vec<Exercise>> {
        let exercises = sqlx::query_as::<_, Exercise>(
            r#"
            SELECT * FROM exercises
            WHERE (?1 IS NULL OR category = ?1)
              AND (?2 IS NULL OR difficulty = ?2)
            ORDER BY id LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(category)
        .bind(difficulty.map(Difficulty::as_str))
        .bind(page.limit)
        .bind(page.skip)
        .fetch_all(&self.pool)
        .await?;
        Ok(exercises)
    }

    pub async fn update_exercise(&self, exercise: &Exercise, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE exercises SET
                title = ?, question = ?, user_answer = ?, is_correct = ?, attempts = ?,
                time_spent = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&exercise.title)
        .bind(&exercise.question)
        .bind(&exercise.user_answer)
        .bind(exercise.is_correct)
        .bind(exercise.attempts)
        .bind(exercise.time_spent)
        .bind(exercise.completed_at)
        .bind(now)
        .bind(exercise.id)
        .execute(&self.pool)
        .await?;
        Ok(found(result))
    }

    pub async fn delete_exercise(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM exercises WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(found(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CardType, DocumentType, ExerciseType, ProcessingStatus, ReviewStatus};
    use crate::srs::apply_review;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 8, 30, 0).unwrap()
    }

    fn new_card(front: &str) -> NewFlashcard {
        NewFlashcard {
            front: front.to_string(),
            back: "answer".to_string(),
            card_type: CardType::Cloze,
            knowledge_point_id: None,
            tags: vec!["chem".to_string()],
            options: Some(serde_json::json!({"hint": "starts with H"})),
        }
    }

    #[tokio::test]
    async fn flashcard_round_trips_every_field() {
        let db = Db::in_memory().await.unwrap();
        let created = db.insert_flashcard(&new_card("H2O is?"), t0()).await.unwrap();

        let reviewed = apply_review(&created, 4, t0() + Duration::minutes(5)).unwrap();
        assert!(db.save_review(&reviewed, 0, t0()).await.unwrap());

        let loaded = db.get_flashcard(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.review, reviewed.review);
        assert_eq!(loaded.card_type, CardType::Cloze);
        assert_eq!(loaded.tags, vec!["chem".to_string()]);
        assert_eq!(loaded.options, created.options);
        assert_eq!(loaded.created_at, t0());
        assert_eq!(loaded.updated_at, Some(t0()));
    }

    #[tokio::test]
    async fn stale_review_is_not_saved() {
        let db = Db::in_memory().await.unwrap();
        let card = db.insert_flashcard(&new_card("Na?"), t0()).await.unwrap();

        let first = apply_review(&card, 5, t0()).unwrap();
        let second = apply_review(&card, 1, t0()).unwrap();
        assert!(db.save_review(&first, 0, t0()).await.unwrap());
        assert!(!db.save_review(&second, 0, t0()).await.unwrap());

        let stored = db.get_flashcard(card.id).await.unwrap().unwrap();
        assert_eq!(stored.review.review_status(), ReviewStatus::Review);
        assert_eq!(stored.review.total_reviews(), 1);
    }

    #[tokio::test]
    async fn due_filter_and_stats() {
        let db = Db::in_memory().await.unwrap();
        let a = db.insert_flashcard(&new_card("a"), t0()).await.unwrap();
        let b = db.insert_flashcard(&new_card("b"), t0()).await.unwrap();
        db.insert_flashcard(&new_card("c"), t0()).await.unwrap();

        // a: due tomorrow; b: failed, due in ten minutes; c: new, due now.
        let a2 = apply_review(&a, 5, t0()).unwrap();
        let b2 = apply_review(&b, 1, t0()).unwrap();
        db.save_review(&a2, 0, t0()).await.unwrap();
        db.save_review(&b2, 0, t0()).await.unwrap();

        let due_now = db.list_flashcards(Page::default(), Some(t0())).await.unwrap();
        assert_eq!(due_now.iter().map(|c| c.front.as_str()).collect::<Vec<_>>(), vec!["c"]);

        let later = t0() + Duration::minutes(30);
        let due_later = db.list_flashcards(Page::default(), Some(later)).await.unwrap();
        assert_eq!(due_later.iter().map(|c| c.front.as_str()).collect::<Vec<_>>(), vec!["c", "b"]);

        let stats = db.flashcard_stats(later).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.due, 2);
        assert_eq!(stats.new, 1);
        assert_eq!(stats.review, 1);
        assert_eq!(stats.relearning, 1);
        assert_eq!(stats.total_reviews, 2);
        assert_eq!(stats.correct_reviews, 1);
        assert_eq!(stats.accuracy, 0.5);
    }

    #[tokio::test]
    async fn corrupt_review_row_fails_to_load() {
        let db = Db::in_memory().await.unwrap();
        let card = db.insert_flashcard(&new_card("x"), t0()).await.unwrap();
        sqlx::query("UPDATE flashcards SET ease_factor = 0.9 WHERE id = ?")
            .bind(card.id)
            .execute(&db.pool)
            .await
            .unwrap();

        assert!(matches!(
            db.get_flashcard(card.id).await,
            Err(DbError::Sqlx(sqlx::Error::Decode(_)))
        ));
    }

    #[tokio::test]
    async fn unknown_knowledge_point_reference_is_rejected() {
        let db = Db::in_memory().await.unwrap();
        let mut new = new_card("orphan");
        new.knowledge_point_id = Some(999);
        assert!(matches!(
            db.insert_flashcard(&new, t0()).await,
            Err(DbError::InvalidReference)
        ));
    }

    #[tokio::test]
    async fn documents_points_and_exercises() {
        let db = Db::in_memory().await.unwrap();

        let doc = db
            .insert_document(
                &NewDocument {
                    title: "notes.txt".to_string(),
                    filename: "abc.txt".to_string(),
                    original_filename: "notes.txt".to_string(),
                    file_path: "/tmp/abc.txt".to_string(),
                    file_size: 12,
                    document_type: DocumentType::Txt,
                },
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(doc.processing_status, ProcessingStatus::Pending);

        let point = db
            .insert_knowledge_point(
                &NewKnowledgePoint {
                    title: "Covalent bonds".to_string(),
                    description: None,
                    content: None,
                    category: Some("chemistry".to_string()),
                    difficulty_level: 2,
                    document_id: Some(doc.id),
                    tags: vec![],
                },
                t0(),
            )
            .await
            .unwrap();
        let listed = db
            .list_knowledge_points(Page::default(), Some("chemistry"))
            .await
            .unwrap();
        assert_eq!(listed, vec![point.clone()]);
        assert!(db
            .list_knowledge_points(Page::default(), Some("history"))
            .await
            .unwrap()
            .is_empty());

        // Deleting the document unlinks the point.
        assert!(db.delete_document(doc.id).await.unwrap());
        let point = db.get_knowledge_point(point.id).await.unwrap().unwrap();
        assert_eq!(point.document_id, None);

        let exercise = db
            .insert_exercise(
                &NewExercise {
                    title: "Bonds".to_string(),
                    question: "What bond forms in H2?".to_string(),
                    exercise_type: ExerciseType::ShortAnswer,
                    difficulty: Difficulty::Beginner,
                    options: None,
                    correct_answer: Some("covalent".to_string()),
                    explanation: None,
                    hints: vec!["shared electrons".to_string()],
                    tags: vec![],
                    category: None,
                    source: Some("llm".to_string()),
                },
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(exercise.hints, vec!["shared electrons".to_string()]);
        assert_eq!(
            db.list_exercises(Page::default(), None, Some(Difficulty::Beginner))
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(db
            .list_exercises(Page::default(), None, Some(Difficulty::Expert))
            .await
            .unwrap()
            .is_empty());

        // Updates report rows that vanished after they were read.
        assert!(db.update_knowledge_point(&point, t0()).await.unwrap());
        assert!(db.update_exercise(&exercise, t0()).await.unwrap());
        assert!(db.delete_knowledge_point(point.id).await.unwrap());
        assert!(db.delete_exercise(exercise.id).await.unwrap());
        assert!(!db.update_document(&doc, t0()).await.unwrap());
        assert!(!db.update_knowledge_point(&point, t0()).await.unwrap());
        assert!(!db.update_exercise(&exercise, t0()).await.unwrap());
    }
}
