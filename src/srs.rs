use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::models::{Flashcard, ReviewStatus};

pub const INITIAL_EASE_FACTOR: f64 = 2.5;
pub const MIN_EASE_FACTOR: f64 = 1.3;
/// Upper bound on the review interval (about a century) so due dates stay
/// representable.
pub const MAX_INTERVAL_DAYS: u32 = 36_500;
pub const RELEARNING_DELAY_MINUTES: i64 = 10;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReviewError {
    #[error("score must be between 1 and 5, got {0}")]
    InvalidScore(i64),
    #[error("review state violates invariant: {0}")]
    InvariantViolation(String),
}

/// A validated recall score.
///
/// 5 - perfect response
/// 4 - correct after a hesitation
/// 3 - correct, recalled with serious difficulty
/// 2 - incorrect, but the answer seemed easy once shown
/// 1 - incorrect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecallScore(u8);

impl RecallScore {
    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_correct(self) -> bool {
        self.0 >= 3
    }

    /// SM-2 ease adjustment, computed in hundredths so that a score of 4 is
    /// exactly neutral.
    fn ease_delta(self) -> f64 {
        let lapse = i64::from(5 - self.0);
        let hundredths = 10 - lapse * (8 + 2 * lapse);
        hundredths as f64 / 100.0
    }
}

impl TryFrom<i64> for RecallScore {
    type Error = ReviewError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1..=5 => Ok(RecallScore(value as u8)),
            _ => Err(ReviewError::InvalidScore(value)),
        }
    }
}

/// Scheduling fields of a flashcard. Only [`ReviewState::new`],
/// [`ReviewState::restore`] and [`ReviewState::apply`] produce values, so
/// every instance satisfies the invariants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewState {
    ease_factor: f64,
    interval: u32,
    repetitions: u32,
    review_status: ReviewStatus,
    total_reviews: u32,
    correct_reviews: u32,
    last_review_score: Option<u8>,
    due_date: DateTime<Utc>,
    last_reviewed: Option<DateTime<Utc>>,
}

/// Review fields as they come back from storage, before validation.
#[derive(Debug, Clone)]
pub struct ReviewRecord {
    pub ease_factor: f64,
    pub interval: i64,
    pub repetitions: i64,
    pub review_status: ReviewStatus,
    pub total_reviews: i64,
    pub correct_reviews: i64,
    pub last_review_score: Option<i64>,
    pub due_date: DateTime<Utc>,
    pub last_reviewed: Option<DateTime<Utc>>,
}

fn counter(field: &str, value: i64) -> Result<u32, ReviewError> {
    u32::try_from(value)
        .map_err(|_| ReviewError::InvariantViolation(format!("{field} = {value}")))
}

impl ReviewState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            ease_factor: INITIAL_EASE_FACTOR,
            interval: 1,
            repetitions: 0,
            review_status: ReviewStatus::New,
            total_reviews: 0,
            correct_reviews: 0,
            last_review_score: None,
            due_date: now,
            last_reviewed: None,
        }
    }

    /// Rebuilds a state from persisted fields. A record that breaks any
    /// invariant is rejected rather than repaired.
    pub fn restore(record: ReviewRecord) -> Result<Self, ReviewError> {
        if !record.ease_factor.is_finite() || record.ease_factor < MIN_EASE_FACTOR {
            return Err(ReviewError::InvariantViolation(format!(
                "ease_factor = {}",
                record.ease_factor
            )));
        }
        let interval = counter("interval", record.interval)?;
        if interval < 1 {
            return Err(ReviewError::InvariantViolation("interval = 0".to_string()));
        }
        let repetitions = counter("repetitions", record.repetitions)?;
        let total_reviews = counter("total_reviews", record.total_reviews)?;
        let correct_reviews = counter("correct_reviews", record.correct_reviews)?;
        if correct_reviews > total_reviews {
            return Err(ReviewError::InvariantViolation(format!(
                "correct_reviews {correct_reviews} > total_reviews {total_reviews}"
            )));
        }
        let last_review_score = match record.last_review_score {
            None => None,
            Some(score) => Some(
                RecallScore::try_from(score)
                    .map_err(|_| {
                        ReviewError::InvariantViolation(format!("last_review_score = {score}"))
                    })?
                    .get(),
            ),
        };
        if (total_reviews == 0) != (record.review_status == ReviewStatus::New) {
            return Err(ReviewError::InvariantViolation(format!(
                "status {} with {total_reviews} reviews",
                record.review_status
            )));
        }

        Ok(Self {
            ease_factor: record.ease_factor,
            interval,
            repetitions,
            review_status: record.review_status,
            total_reviews,
            correct_reviews,
            last_review_score,
            due_date: record.due_date,
            last_reviewed: record.last_reviewed,
        })
    }

    pub fn ease_factor(&self) -> f64 {
        self.ease_factor
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn repetitions(&self) -> u32 {
        self.repetitions
    }

    pub fn review_status(&self) -> ReviewStatus {
        self.review_status
    }

    pub fn total_reviews(&self) -> u32 {
        self.total_reviews
    }

    pub fn correct_reviews(&self) -> u32 {
        self.correct_reviews
    }

    pub fn last_review_score(&self) -> Option<u8> {
        self.last_review_score
    }

    pub fn due_date(&self) -> DateTime<Utc> {
        self.due_date
    }

    pub fn last_reviewed(&self) -> Option<DateTime<Utc>> {
        self.last_reviewed
    }

    /// Computes the state after one review.
    pub fn apply(&self, score: RecallScore, now: DateTime<Utc>) -> ReviewState {
        let mut next = self.clone();
        next.total_reviews = self.total_reviews.saturating_add(1);
        next.last_review_score = Some(score.get());
        next.last_reviewed = Some(now);

        if score.is_correct() {
            next.correct_reviews = self.correct_reviews.saturating_add(1);
            next.repetitions = self.repetitions.saturating_add(1);

            // Growth uses the interval and ease from before this review.
            next.interval = match next.repetitions {
                1 => 1,
                2 => 6,
                _ => {
                    let grown = (f64::from(self.interval) * self.ease_factor).trunc() as u32;
                    grown.clamp(1, MAX_INTERVAL_DAYS)
                }
            };
            next.ease_factor = (self.ease_factor + score.ease_delta()).max(MIN_EASE_FACTOR);
            next.due_date = shift(now, Duration::days(i64::from(next.interval)));
            next.review_status = ReviewStatus::Review;
        } else {
            next.repetitions = 0;
            next.interval = 1;
            next.due_date = shift(now, Duration::minutes(RELEARNING_DELAY_MINUTES));
            next.review_status = ReviewStatus::Relearning;
        }

        next
    }
}

fn shift(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    now.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Applies a review to a card and returns the updated copy. The input card is
/// never modified; an invalid score yields an error and no new card.
pub fn apply_review(
    card: &Flashcard,
    score: i64,
    now: DateTime<Utc>,
) -> Result<Flashcard, ReviewError> {
    let score = RecallScore::try_from(score)?;
    let mut next = card.clone();
    next.review = card.review.apply(score, now);
    Ok(next)
}
