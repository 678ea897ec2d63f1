use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::srs::ReviewState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("{0} must not be blank")]
    Blank(&'static str),
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
    #[error("unknown {kind}: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

/// Closed enum with a fixed snake_case string form, used both on the wire and
/// in storage.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ModelError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(
    /// Presentation tag for a flashcard. The scheduler never looks at it.
    CardType, "card type" {
        Basic => "basic",
        Cloze => "cloze",
        Reverse => "reverse",
        MultipleChoice => "multiple_choice",
    }
);

string_enum!(
    ReviewStatus, "review status" {
        New => "new",
        Learning => "learning",
        Review => "review",
        Relearning => "relearning",
    }
);

string_enum!(
    DocumentType, "document type" {
        Pdf => "pdf",
        Ppt => "ppt",
        Pptx => "pptx",
        Doc => "doc",
        Docx => "docx",
        Txt => "txt",
    }
);

string_enum!(
    ProcessingStatus, "processing status" {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
);

string_enum!(
    ExerciseType, "exercise type" {
        MultipleChoice => "multiple_choice",
        ShortAnswer => "short_answer",
        Essay => "essay",
        ProblemSolving => "problem_solving",
        Code => "code",
    }
);

string_enum!(
    Difficulty, "difficulty" {
        Beginner => "beginner",
        Intermediate => "intermediate",
        Advanced => "advanced",
        Expert => "expert",
    }
);

impl Default for CardType {
    fn default() -> Self {
        CardType::Basic
    }
}

impl Default for Difficulty {
    fn default() -> Self {
        Difficulty::Intermediate
    }
}

impl DocumentType {
    /// Detects the type from a file name's extension, case-insensitively.
    pub fn from_filename(name: &str) -> Option<Self> {
        let (_, ext) = name.rsplit_once('.')?;
        ext.to_ascii_lowercase().parse().ok()
    }
}

fn required(field: &'static str, value: &str) -> Result<(), ModelError> {
    if value.trim().is_empty() {
        return Err(ModelError::Blank(field));
    }
    Ok(())
}

fn difficulty_level(value: i64) -> Result<(), ModelError> {
    if !(1..=5).contains(&value) {
        return Err(ModelError::OutOfRange {
            field: "difficulty_level",
            value: value.to_string(),
        });
    }
    Ok(())
}

fn mastery_level(value: f64) -> Result<(), ModelError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ModelError::OutOfRange {
            field: "mastery_level",
            value: value.to_string(),
        });
    }
    Ok(())
}

// --- Flashcards ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flashcard {
    pub id: i64,
    pub front: String,
    pub back: String,
    pub card_type: CardType,
    pub options: Option<serde_json::Value>,
    #[serde(flatten)]
    pub review: ReviewState,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub knowledge_point_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFlashcard {
    pub front: String,
    pub back: String,
    #[serde(default)]
    pub card_type: CardType,
    pub knowledge_point_id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub options: Option<serde_json::Value>,
}

impl NewFlashcard {
    pub fn validate(&self) -> Result<(), ModelError> {
        required("front", &self.front)?;
        required("back", &self.back)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlashcardPatch {
    pub front: Option<String>,
    pub back: Option<String>,
    pub tags: Option<Vec<String>>,
    pub notes: Option<String>,
}

impl FlashcardPatch {
    /// Validates every present field before touching the card.
    pub fn apply(self, card: &mut Flashcard) -> Result<(), ModelError> {
        if let Some(front) = &self.front {
            required("front", front)?;
        }
        if let Some(back) = &self.back {
            required("back", back)?;
        }

        if let Some(front) = self.front {
            card.front = front;
        }
        if let Some(back) = self.back {
            card.back = back;
        }
        if let Some(tags) = self.tags {
            card.tags = tags;
        }
        if let Some(notes) = self.notes {
            card.notes = Some(notes);
        }
        Ok(())
    }
}

// --- Documents ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub filename: String,
    pub original_filename: String,
    #[serde(skip)]
    pub file_path: String,
    pub file_size: i64,
    pub document_type: DocumentType,
    pub processing_status: ProcessingStatus,
    pub processing_error: Option<String>,
    #[serde(skip)]
    pub raw_content: Option<String>,
    pub processed_content: Option<String>,
    pub summary: Option<String>,
    pub language: Option<String>,
    pub page_count: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub filename: String,
    pub original_filename: String,
    pub file_path: String,
    pub file_size: i64,
    pub document_type: DocumentType,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentPatch {
    pub title: Option<String>,
    pub summary: Option<String>,
}

impl DocumentPatch {
    pub fn apply(self, doc: &mut Document) -> Result<(), ModelError> {
        if let Some(title) = &self.title {
            required("title", title)?;
        }

        if let Some(title) = self.title {
            doc.title = title;
        }
        if let Some(summary) = self.summary {
            doc.summary = Some(summary);
        }
        Ok(())
    }
}

// --- Knowledge points ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgePoint {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub content: Option<String>,
    pub mastery_level: f64,
    pub times_reviewed: i64,
    pub last_reviewed: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub difficulty_level: i64,
    pub document_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_difficulty_level() -> i64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewKnowledgePoint {
    pub title: String,
    pub description: Option<String>,
    pub content: Option<String>,
    pub category: Option<String>,
    #[serde(default = "default_difficulty_level")]
    pub difficulty_level: i64,
    pub document_id: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewKnowledgePoint {
    pub fn validate(&self) -> Result<(), ModelError> {
        required("title", &self.title)?;
        difficulty_level(self.difficulty_level)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KnowledgePointPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub category: Option<String>,
    pub difficulty_level: Option<i64>,
    pub mastery_level: Option<f64>,
    pub tags: Option<Vec<String>>,
}

impl KnowledgePointPatch {
    pub fn apply(self, point: &mut KnowledgePoint) -> Result<(), ModelError> {
        if let Some(title) = &self.title {
            required("title", title)?;
        }
        if let Some(level) = self.difficulty_level {
            difficulty_level(level)?;
        }
        if let Some(level) = self.mastery_level {
            mastery_level(level)?;
        }

        if let Some(title) = self.title {
            point.title = title;
        }
        if let Some(description) = self.description {
            point.description = Some(description);
        }
        if let Some(content) = self.content {
            point.content = Some(content);
        }
        if let Some(category) = self.category {
            point.category = Some(category);
        }
        if let Some(level) = self.difficulty_level {
            point.difficulty_level = level;
        }
        if let Some(level) = self.mastery_level {
            point.mastery_level = level;
        }
        if let Some(tags) = self.tags {
            point.tags = tags;
        }
        Ok(())
    }
}

// --- Exercises ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exercise {
    pub id: i64,
    pub title: String,
    pub question: String,
    pub exercise_type: ExerciseType,
    pub difficulty: Difficulty,
    pub options: Option<serde_json::Value>,
    #[serde(skip)]
    pub correct_answer: Option<String>,
    pub explanation: Option<String>,
    pub hints: Vec<String>,
    pub user_answer: Option<String>,
    pub is_correct: Option<bool>,
    pub attempts: i64,
    pub time_spent: Option<i64>,
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewExercise {
    pub title: String,
    pub question: String,
    pub exercise_type: ExerciseType,
    #[serde(default)]
    pub difficulty: Difficulty,
    pub options: Option<serde_json::Value>,
    pub correct_answer: Option<String>,
    pub explanation: Option<String>,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub source: Option<String>,
}

impl NewExercise {
    pub fn validate(&self) -> Result<(), ModelError> {
        required("title", &self.title)?;
        required("question", &self.question)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExercisePatch {
    pub title: Option<String>,
    pub question: Option<String>,
}

impl ExercisePatch {
    pub fn apply(self, exercise: &mut Exercise) -> Result<(), ModelError> {
        if let Some(title) = &self.title {
            required("title", title)?;
        }
        if let Some(question) = &self.question {
            required("question", question)?;
        }

        if let Some(title) = self.title {
            exercise.title = title;
        }
        if let Some(question) = self.question {
            exercise.question = question;
        }
        Ok(())
    }
}
