use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::{Db, DbError, FlashcardStats, Page};
use crate::models::Flashcard;
use crate::srs::{self, RecallScore, ReviewError};

const MAX_REVIEW_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ReviewServiceError {
    #[error(transparent)]
    Review(#[from] ReviewError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("flashcard {0} kept changing during review, try again")]
    Conflict(i64),
}

/// Load / schedule / store loop around the scheduler.
#[derive(Clone)]
pub struct ReviewService {
    db: Db,
}

impl ReviewService {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Records one review of card `id`. The write only lands if nobody else
    /// reviewed the card since it was read; otherwise the review is replayed
    /// on the fresh state, a bounded number of times.
    pub async fn review(
        &self,
        id: i64,
        score: i64,
        now: DateTime<Utc>,
    ) -> Result<Flashcard, ReviewServiceError> {
        RecallScore::try_from(score)?;

        for attempt in 1..=MAX_REVIEW_ATTEMPTS {
            let card = self
                .db
                .get_flashcard(id)
                .await?
                .ok_or(DbError::NotFound("flashcard", id))?;

            let expected = card.review.total_reviews();
            let updated = srs::apply_review(&card, score, now)?;

            if self.db.save_review(&updated, expected, now).await? {
                log::debug!(
                    "flashcard {} reviewed with score {}: interval {}d, status {}",
                    id,
                    score,
                    updated.review.interval(),
                    updated.review.review_status()
                );
                return Ok(updated);
            }
            log::warn!("flashcard {} changed during review (attempt {})", id, attempt);
        }

        Err(ReviewServiceError::Conflict(id))
    }

    pub async fn due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Flashcard>, DbError> {
        self.db
            .list_flashcards(Page { skip: 0, limit }, Some(now))
            .await
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> Result<FlashcardStats, DbError> {
        self.db.flashcard_stats(now).await
    }
}
