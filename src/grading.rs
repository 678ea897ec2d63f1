use chrono::{DateTime, Utc};

use crate::models::Exercise;

fn normalize(answer: &str) -> String {
    answer.trim().to_lowercase()
}

/// Case- and whitespace-insensitive comparison against the expected answer.
/// `None` when there is nothing to compare.
pub fn check_answer(expected: Option<&str>, given: &str) -> Option<bool> {
    let expected = expected.filter(|e| !e.trim().is_empty())?;
    if given.trim().is_empty() {
        return None;
    }
    Some(normalize(expected) == normalize(given))
}

/// Records an attempt on an exercise.
pub fn submit(exercise: &mut Exercise, answer: String, time_spent: Option<i64>, now: DateTime<Utc>) {
    exercise.attempts += 1;

    if let Some(verdict) = check_answer(exercise.correct_answer.as_deref(), &answer) {
        exercise.is_correct = Some(verdict);
    }
    exercise.user_answer = Some(answer);

    if let Some(seconds) = time_spent.filter(|s| *s > 0) {
        exercise.time_spent = Some(exercise.time_spent.unwrap_or(0) + seconds);
    }

    if exercise.is_correct == Some(true) && exercise.completed_at.is_none() {
        exercise.completed_at = Some(now);
    }
}
