//! HTTP client for the HR/identity directory.
//!
//! `GET {base}/subjects/{subject_id}` answers with a JSON
//! [`SubjectAttributes`] body. A 404 means the directory has no record of
//! the subject; every other failure is reported as unavailable so the
//! resolver fails closed. Lookups are not retried: the resolver bounds each
//! lookup and a retry loop would only eat into that budget.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};

use vigil_core::SubjectId;
use vigil_policy::directory::DirectoryError;
use vigil_policy::{DirectoryLookup, SubjectAttributes};

/// Directory lookup over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpDirectory {
    /// Client for the directory rooted at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, String> {
        let base_url = Url::parse(base_url).map_err(|e| format!("invalid directory URL {base_url:?}: {e}"))?;
        if base_url.cannot_be_a_base() {
            return Err(format!("directory URL {base_url} cannot be used as a base"));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build directory HTTP client: {e}"))?;
        Ok(Self { http, base_url })
    }

    fn subject_url(&self, subject: &SubjectId) -> Result<Url, DirectoryError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DirectoryError::Unavailable("directory URL cannot be a base".into()))?
            .pop_if_empty()
            .push("subjects")
            .push(subject.as_str());
        Ok(url)
    }
}

#[async_trait]
impl DirectoryLookup for HttpDirectory {
    async fn lookup(&self, subject: &SubjectId) -> Result<SubjectAttributes, DirectoryError> {
        let url = self.subject_url(subject)?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| DirectoryError::Unavailable(format!("GET subjects/{subject}: {e}")))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(DirectoryError::NotFound(subject.clone())),
            status if status.is_success() => resp
                .json::<SubjectAttributes>()
                .await
                .map_err(|e| DirectoryError::Unavailable(format!("malformed directory response: {e}"))),
            status => Err(DirectoryError::Unavailable(format!(
                "directory answered {status} for subject {subject}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use axum::{Json, Router};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/directory/")
    }

    async fn subject(Path(id): Path<String>) -> Result<Json<SubjectAttributes>, AxumStatus> {
        match id.as_str() {
            "emp-1" => Ok(Json(
                SubjectAttributes::new("emp-1").with_department("Finance").with_role("Manager"),
            )),
            "broken" => Err(AxumStatus::INTERNAL_SERVER_ERROR),
            _ => Err(AxumStatus::NOT_FOUND),
        }
    }

    async fn directory() -> HttpDirectory {
        let base = serve(Router::new().route("/directory/subjects/:id", get(subject))).await;
        HttpDirectory::new(&base, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn known_subject_resolves() {
        let attrs = directory()
            .await
            .lookup(&SubjectId::new("emp-1").unwrap())
            .await
            .unwrap();
        assert_eq!(attrs.department.as_deref(), Some("Finance"));
        assert_eq!(attrs.role.as_deref(), Some("Manager"));
    }

    #[tokio::test]
    async fn missing_subject_is_not_found() {
        let err = directory()
            .await
            .lookup(&SubjectId::new("emp-404").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let err = directory()
            .await
            .lookup(&SubjectId::new("broken").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::Unavailable(_)));
    }

    #[tokio::test]
    async fn unreachable_directory_is_unavailable() {
        let directory = HttpDirectory::new("http://127.0.0.1:1/", Duration::from_millis(200)).unwrap();
        let err = directory
            .lookup(&SubjectId::new("emp-1").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::Unavailable(_)));
    }

    #[test]
    fn subject_ids_are_path_encoded() {
        let directory = HttpDirectory::new("http://dir.internal/api", Duration::from_secs(1)).unwrap();
        let url = directory
            .subject_url(&SubjectId::new("corp/jane doe").unwrap())
            .unwrap();
        assert_eq!(url.as_str(), "http://dir.internal/api/subjects/corp%2Fjane%20doe");
    }

    #[test]
    fn invalid_base_url_rejected() {
        assert!(HttpDirectory::new("not a url", Duration::from_secs(1)).is_err());
    }
}
