use std::{collections::HashMap, path::Path, sync::Arc};

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CatalogError, CatalogResult, Question, QuestionRef, QuizCatalog, QuizOutline};

/// A complete quiz as stored in fixture files.
#[derive(Debug, Clone, Deserialize)]
pub struct QuizFixture {
    pub quiz_id: Uuid,
    pub title: String,
    pub questions: Vec<Question>,
}

impl QuizFixture {
    fn outline(&self) -> QuizOutline {
        QuizOutline {
            quiz_id: self.quiz_id,
            title: self.title.clone(),
            questions: self
                .questions
                .iter()
                .map(|question| QuestionRef {
                    id: question.id,
                    order: question.order,
                })
                .collect(),
        }
    }
}

/// Catalog holding quizzes in memory, seeded programmatically or from a JSON fixtures file.
#[derive(Clone, Default)]
pub struct MemoryQuizCatalog {
    quizzes: Arc<RwLock<HashMap<Uuid, QuizFixture>>>,
}

impl MemoryQuizCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quizzes(quizzes: impl IntoIterator<Item = QuizFixture>) -> Self {
        let map = quizzes
            .into_iter()
            .map(|quiz| (quiz.quiz_id, quiz))
            .collect();
        Self {
            quizzes: Arc::new(RwLock::new(map)),
        }
    }

    /// Load a JSON array of quizzes.
    pub async fn from_path(path: &Path) -> CatalogResult<Self> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| CatalogError::FixturesRead {
                    path: path.to_path_buf(),
                    source,
                })?;
        let quizzes: Vec<QuizFixture> =
            serde_json::from_str(&contents).map_err(|source| CatalogError::FixturesFormat {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::with_quizzes(quizzes))
    }

    pub async fn insert(&self, quiz: QuizFixture) {
        self.quizzes.write().await.insert(quiz.quiz_id, quiz);
    }
}

impl QuizCatalog for MemoryQuizCatalog {
    fn quiz_outline(&self, quiz_id: Uuid) -> BoxFuture<'static, CatalogResult<Option<QuizOutline>>> {
        let quizzes = self.quizzes.clone();
        Box::pin(async move { Ok(quizzes.read().await.get(&quiz_id).map(QuizFixture::outline)) })
    }

    fn question(
        &self,
        quiz_id: Uuid,
        question_id: Uuid,
    ) -> BoxFuture<'static, CatalogResult<Option<Question>>> {
        let quizzes = self.quizzes.clone();
        Box::pin(async move {
            let guard = quizzes.read().await;
            Ok(guard.get(&quiz_id).and_then(|quiz| {
                quiz.questions
                    .iter()
                    .find(|question| question.id == question_id)
                    .cloned()
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::{models::QuestionType, quiz_catalog::QuestionOption};

    fn quiz() -> QuizFixture {
        QuizFixture {
            quiz_id: Uuid::new_v4(),
            title: "Rivers".into(),
            questions: vec![Question {
                id: Uuid::new_v4(),
                order: 1,
                content: "Longest river?".into(),
                question_type: QuestionType::SingleChoice,
                media: None,
                time_limit_secs: 20,
                have_time_factor: false,
                time_factor: 0.0,
                options: vec![QuestionOption {
                    id: Uuid::new_v4(),
                    content: "Nile".into(),
                    is_correct: true,
                    mark: 100.0,
                    color: None,
                }],
            }],
        }
    }

    #[tokio::test]
    async fn outline_lists_question_refs() {
        let quiz = quiz();
        let question_id = quiz.questions[0].id;
        let quiz_id = quiz.quiz_id;
        let catalog = MemoryQuizCatalog::with_quizzes([quiz]);

        let outline = catalog.quiz_outline(quiz_id).await.unwrap().expect("known quiz");
        assert_eq!(outline.questions, vec![QuestionRef { id: question_id, order: 1 }]);
        assert!(catalog.question(quiz_id, question_id).await.unwrap().is_some());
        assert!(catalog.quiz_outline(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_fixture_file_is_reported() {
        let err = MemoryQuizCatalog::from_path(Path::new("/nonexistent/quizzes.json"))
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, CatalogError::FixturesRead { .. }));
    }
}
