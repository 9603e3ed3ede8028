//! Read-side of quizzes: the outline of a quiz and the body of each question.

#[cfg(feature = "http-catalog")]
pub mod http;
pub mod memory;

use std::{error::Error, path::PathBuf};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::dao::models::QuestionType;

pub type CatalogResult<T> = Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read quiz fixtures from `{path}`")]
    FixturesRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("quiz fixtures in `{path}` are malformed")]
    FixturesFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("quiz catalog unavailable: {message}")]
    Unavailable {
        message: String,
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

/// Kind of media attached to a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct QuestionMedia {
    pub url: String,
    pub kind: MediaKind,
    /// How long the media phase lasts before options are shown.
    pub duration_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct QuestionOption {
    pub id: Uuid,
    pub content: String,
    pub is_correct: bool,
    /// Marks awarded when this option is chosen.
    #[serde(default)]
    pub mark: f64,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Question {
    pub id: Uuid,
    /// Authoring position of the question within its quiz.
    pub order: u32,
    pub content: String,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    #[serde(default)]
    pub media: Option<QuestionMedia>,
    pub time_limit_secs: u64,
    #[serde(default)]
    pub have_time_factor: bool,
    #[serde(default)]
    pub time_factor: f64,
    pub options: Vec<QuestionOption>,
}

impl Question {
    pub fn correct_option_ids(&self) -> Vec<Uuid> {
        self.options
            .iter()
            .filter(|option| option.is_correct)
            .map(|option| option.id)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QuestionRef {
    pub id: Uuid,
    pub order: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QuizOutline {
    pub quiz_id: Uuid,
    pub title: String,
    pub questions: Vec<QuestionRef>,
}

impl QuizOutline {
    /// Questions that will be played, in authoring order, skipping `exempted` ids.
    pub fn playable(&self, exempted: &[Uuid]) -> Vec<QuestionRef> {
        let mut questions: Vec<QuestionRef> = self
            .questions
            .iter()
            .filter(|question| !exempted.contains(&question.id))
            .copied()
            .collect();
        questions.sort_by_key(|question| question.order);
        questions
    }
}

/// Source of quiz content consumed by session controllers.
pub trait QuizCatalog: Send + Sync {
    fn quiz_outline(&self, quiz_id: Uuid) -> BoxFuture<'static, CatalogResult<Option<QuizOutline>>>;
    fn question(
        &self,
        quiz_id: Uuid,
        question_id: Uuid,
    ) -> BoxFuture<'static, CatalogResult<Option<Question>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playable_questions_skip_exempted_and_keep_order() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let outline = QuizOutline {
            quiz_id: Uuid::new_v4(),
            title: "Capitals".into(),
            questions: vec![
                QuestionRef { id: c, order: 3 },
                QuestionRef { id: a, order: 1 },
                QuestionRef { id: b, order: 2 },
            ],
        };

        let ids: Vec<Uuid> = outline.playable(&[b]).into_iter().map(|q| q.id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[test]
    fn question_decodes_catalog_json() {
        let question: Question = serde_json::from_value(serde_json::json!({
            "id": Uuid::nil(),
            "order": 1,
            "content": "2 + 2?",
            "type": "SINGLE_CHOICE",
            "time_limit_secs": 20,
            "options": [
                {"id": Uuid::nil(), "content": "4", "is_correct": true, "mark": 100.0}
            ]
        }))
        .expect("valid question");

        assert_eq!(question.question_type, QuestionType::SingleChoice);
        assert!(!question.have_time_factor);
        assert!(question.media.is_none());
        assert_eq!(question.correct_option_ids(), vec![Uuid::nil()]);
    }
}
