use crate::{registry::ModelLoader, server::SharedState};
use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};

const API_VERSION: &str = "2.0";

#[derive(Serialize, Deserialize)]
pub struct Health {
    status: String,
    model_loaded: bool,
    version: String,
}

pub async fn healthcheck<L: ModelLoader>(State(state): State<SharedState<L>>) -> Json<Health> {
    Json(Health {
        status: "ok".into(),
        model_loaded: state.registry.is_loaded(),
        version: API_VERSION.into(),
    })
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{body_json, test_router};
    use crate::test_utils::{write_model, MockModelSpec};
    use axum::{body::Body, http::Request};
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_reports_model_state() {
        let dir = tempfile::tempdir().unwrap();
        let (router, registry) = test_router(dir.path());

        let request = || Request::get("/health").body(Body::empty()).unwrap();

        let response = router.clone().oneshot(request()).await.unwrap();
        assert_eq!(
            body_json(response).await,
            json!({"status": "ok", "model_loaded": false, "version": "2.0"})
        );

        write_model(dir.path(), "v1", &MockModelSpec::default(), r#"{"a": 0}"#);
        registry.load_model("v1").unwrap();

        let response = router.oneshot(request()).await.unwrap();
        assert_eq!(body_json(response).await["model_loaded"], json!(true));
    }
}
