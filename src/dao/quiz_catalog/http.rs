use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use uuid::Uuid;

use super::{CatalogError, CatalogResult, Question, QuizCatalog, QuizOutline};

#[derive(Debug, Error)]
pub enum HttpCatalogError {
    #[error("failed to build quiz catalog client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to send quiz catalog request to `{path}`")]
    RequestSend {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected quiz catalog response status {status} for `{path}`")]
    RequestStatus { path: String, status: StatusCode },
    #[error("failed to decode quiz catalog response for `{path}`")]
    DecodeResponse {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

impl From<HttpCatalogError> for CatalogError {
    fn from(err: HttpCatalogError) -> Self {
        CatalogError::Unavailable {
            message: err.to_string(),
            source: Box::new(err),
        }
    }
}

/// Quiz catalog served by the quiz authoring service over HTTP.
///
/// Expects `GET {base}/quizzes/{quiz_id}` to return a [`QuizOutline`] and
/// `GET {base}/quizzes/{quiz_id}/questions/{question_id}` to return a [`Question`].
#[derive(Clone)]
pub struct HttpQuizCatalog {
    client: Client,
    base_url: Arc<str>,
}

impl HttpQuizCatalog {
    pub fn new(base_url: &str) -> Result<Self, HttpCatalogError> {
        let client = Client::builder()
            .timeout(crate::dao::storage::IO_DEADLINE)
            .build()
            .map_err(|source| HttpCatalogError::ClientBuilder { source })?;
        Ok(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
        })
    }

    async fn get_document<T>(&self, path: String) -> Result<Option<T>, HttpCatalogError>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| HttpCatalogError::RequestSend {
                path: path.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<T>()
                .await
                .map(Some)
                .map_err(|source| HttpCatalogError::DecodeResponse { path, source }),
            other => Err(HttpCatalogError::RequestStatus {
                path,
                status: other,
            }),
        }
    }
}

impl QuizCatalog for HttpQuizCatalog {
    fn quiz_outline(&self, quiz_id: Uuid) -> BoxFuture<'static, CatalogResult<Option<QuizOutline>>> {
        let catalog = self.clone();
        Box::pin(async move {
            catalog
                .get_document(format!("quizzes/{quiz_id}"))
                .await
                .map_err(Into::into)
        })
    }

    fn question(
        &self,
        quiz_id: Uuid,
        question_id: Uuid,
    ) -> BoxFuture<'static, CatalogResult<Option<Question>>> {
        let catalog = self.clone();
        Box::pin(async move {
            catalog
                .get_document(format!("quizzes/{quiz_id}/questions/{question_id}"))
                .await
                .map_err(Into::into)
        })
    }
}
