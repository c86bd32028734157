//! HTTP surface of the student workflows.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use shared::competency::{course_progress, record_assessment};
use shared::config::Settings;
use shared::context::{Clock, RequestContext};
use shared::dto::{
    AssessmentRecorded, CompetencyProgress, CourseEnrolled, DuplicateQuery, DuplicateReport,
    EnrollRequest, NewAssessmentRequest, NewStudentRequest, StudentCreated, StudentDeleted,
    StudentDetail, StudentFilter, StudentListing, UpdateOutcome, UpdateStudentRequest,
};
use shared::enrollment::{create_student, enroll_student};
use shared::error::AppError;
use shared::roster::{delete_student, find_duplicates, get_student, list_students};
use shared::store::Store;
use shared::update::update_student;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, settings: Settings) -> Self {
        Self {
            store,
            settings: Arc::new(settings),
        }
    }

    fn context(&self) -> RequestContext {
        RequestContext::new(&self.settings, Clock::system())
    }
}

#[derive(Serialize, Debug)]
pub struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_err(e: AppError) -> ApiError {
    let status = match &e {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::Conflict(_) => StatusCode::CONFLICT,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("db error: {}", e);
    } else {
        warn!(%status, "request rejected: {}", e);
    }
    (status, Json(ErrorResponse { error: e.to_string() }))
}

/// Unwraps a JSON body, reporting malformed payloads in the usual error shape.
fn payload<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => {
            warn!(status = %rejection.status(), "rejected body: {}", rejection.body_text());
            Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: rejection.body_text(),
                }),
            ))
        }
    }
}

/// Simple liveness endpoint for orchestration.
async fn health() -> &'static str {
    "OK"
}

/* ---------------- students ---------------- */

async fn create(
    State(state): State<AppState>,
    body: Result<Json<NewStudentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StudentCreated>), ApiError> {
    let req = payload(body)?;
    let created = create_student(state.store.as_ref(), &state.context(), req)
        .await
        .map_err(api_err)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list(
    State(state): State<AppState>,
    Query(filter): Query<StudentFilter>,
) -> Result<Json<Vec<StudentListing>>, ApiError> {
    let students = list_students(state.store.as_ref(), &filter)
        .await
        .map_err(api_err)?;
    Ok(Json(students))
}

async fn detail(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<StudentDetail>, ApiError> {
    let student = get_student(state.store.as_ref(), &id).await.map_err(api_err)?;
    Ok(Json(student))
}

async fn update(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: Result<Json<UpdateStudentRequest>, JsonRejection>,
) -> Result<Json<UpdateOutcome>, ApiError> {
    let req = payload(body)?;
    info!(student_id = %id, mode = ?req.mode(), "updating student");
    let outcome = update_student(state.store.as_ref(), &state.context(), &id, req)
        .await
        .map_err(api_err)?;
    Ok(Json(outcome))
}

async fn remove(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<StudentDeleted>, ApiError> {
    let deleted = delete_student(state.store.as_ref(), &id).await.map_err(api_err)?;
    Ok(Json(deleted))
}

async fn enroll(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: Result<Json<EnrollRequest>, JsonRejection>,
) -> Result<Json<CourseEnrolled>, ApiError> {
    let req = payload(body)?;
    let enrolled = enroll_student(state.store.as_ref(), &state.context(), &id, req.course_id)
        .await
        .map_err(api_err)?;
    Ok(Json(enrolled))
}

async fn check_duplicates(
    State(state): State<AppState>,
    Query(query): Query<DuplicateQuery>,
) -> Result<Json<DuplicateReport>, ApiError> {
    let report = find_duplicates(state.store.as_ref(), &query)
        .await
        .map_err(api_err)?;
    Ok(Json(report))
}

/* ---------------- competency ---------------- */

async fn record(
    State(state): State<AppState>,
    body: Result<Json<NewAssessmentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AssessmentRecorded>), ApiError> {
    let req = payload(body)?;
    let recorded = record_assessment(state.store.as_ref(), &state.context(), req)
        .await
        .map_err(api_err)?;
    Ok((StatusCode::CREATED, Json(recorded)))
}

async fn progress(
    Path((id, course_id)): Path<(String, i64)>,
    State(state): State<AppState>,
) -> Result<Json<CompetencyProgress>, ApiError> {
    let progress = course_progress(state.store.as_ref(), &id, course_id)
        .await
        .map_err(api_err)?;
    Ok(Json(progress))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/students", get(list).post(create))
        .route("/students/check-duplicates", get(check_duplicates))
        .route("/students/competency-assessments", post(record))
        .route("/students/:id", get(detail).put(update).delete(remove))
        .route("/students/:id/enroll", post(enroll))
        .route("/students/:id/courses/:course_id/competency", get(progress))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, Response};
    use serde_json::{json, Value};
    use shared::memory::MemoryStore;
    use tower::ServiceExt;

    async fn app() -> (Router, MemoryStore) {
        let store = MemoryStore::new();
        store.add_course(7, "Price Action").await;
        store.add_course(8, "Risk Management").await;
        let state = AppState::new(Arc::new(store.clone()), Settings::default());
        (router(state), store)
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(res: Response<axum::body::BoxBody>) -> Value {
        let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_ok() {
        let (app, _) = app().await;
        let res = app.oneshot(request("GET", "/health", None)).await.unwrap();
        assert!(res.status().is_success());
    }

    #[tokio::test]
    async fn create_with_course_opens_batch_and_seeds_assessment() {
        let (app, store) = app().await;
        let res = app
            .oneshot(request(
                "POST",
                "/students",
                Some(json!({ "first_name": "Maria", "last_name": "Santos", "course_id": 7 })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let body = json_body(res).await;
        assert_eq!(body["message"], "Student created and enrolled successfully");
        assert_eq!(body["username"], "mariasantos");
        assert_eq!(body["action"], "created_new");
        assert_eq!(body["enrollment"]["course_id"], 7);
        assert_eq!(body["enrollment"]["course_name"], "Price Action");
        assert_eq!(
            body["competency_assessment"],
            json!({ "type": "Basic", "course_id": 7, "score": 0.0, "status": "failed", "attempt": 1 })
        );

        let tables = store.snapshot().await;
        assert_eq!(tables.batches.len(), 1);
        assert_eq!(body["enrollment"]["batch_id"], tables.batches[0].batch_id);
        assert_eq!(tables.batches[0].course_id, 7);
    }

    #[tokio::test]
    async fn student_form_payload_with_text_numbers() {
        let (app, store) = app().await;
        let res = app
            .clone()
            .oneshot(request(
                "POST",
                "/students",
                Some(json!({
                    "student_id": "STU1718000000000",
                    "first_name": "Maria",
                    "middle_name": "",
                    "last_name": "Santos",
                    "gender": "Female",
                    "birth_date": "",
                    "birth_place": "",
                    "phone_number": "",
                    "address": "",
                    "batch_id": "",
                    "course_id": "7",
                    "mode": "update",
                    "learning_device": "",
                    "age": "",
                    "rating": ""
                })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let body = json_body(res).await;
        assert_eq!(body["student_id"], "STU1718000000000");
        assert_eq!(body["enrollment"]["course_id"], 7);

        let tables = store.snapshot().await;
        assert_eq!(tables.students.len(), 1);
        assert_eq!(tables.enrollments.len(), 1);
        assert_eq!(tables.students[0].middle_name, None);

        // The edit form resends the row with the course picked as text.
        let res = app
            .oneshot(request(
                "PUT",
                "/students/STU1718000000000",
                Some(json!({
                    "first_name": "Maria",
                    "last_name": "Santos",
                    "batch_id": "",
                    "course_id": "8",
                    "mode": "update",
                    "age": "30",
                    "rating": "4"
                })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["new_competency_assessment"]["course_id"], 8);

        let student = store.snapshot().await.students[0].clone();
        assert_eq!(student.age, Some(30));
        assert_eq!(student.rating, Some(4.0));
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request_with_error_field() {
        let (app, store) = app().await;
        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/students")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"first_name\": "))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(res).await["error"].is_string());

        let res = app
            .oneshot(request(
                "POST",
                "/students/S-1/enroll",
                Some(json!({ "course_id": "seven" })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = json_body(res).await;
        assert!(body["error"].as_str().unwrap().contains("invalid number"), "{body}");
        assert!(store.snapshot().await.enrollments.is_empty());
    }

    #[tokio::test]
    async fn missing_names_are_bad_request() {
        let (app, store) = app().await;
        let res = app
            .oneshot(request("POST", "/students", Some(json!({ "first_name": "Solo" }))))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = json_body(res).await;
        assert_eq!(body["error"], "First name and last name are required");
        assert!(store.snapshot().await.accounts.is_empty());
    }

    #[tokio::test]
    async fn unknown_course_is_not_found() {
        let (app, store) = app().await;
        let res = app
            .oneshot(request(
                "POST",
                "/students",
                Some(json!({ "first_name": "A", "last_name": "B", "course_id": 99 })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let tables = store.snapshot().await;
        assert!(tables.accounts.is_empty());
        assert!(tables.students.is_empty());
    }

    #[tokio::test]
    async fn duplicate_student_id_conflicts() {
        let (app, store) = app().await;
        store.add_student("S-1", "Existing", "Person").await;
        let res = app
            .oneshot(request(
                "POST",
                "/students",
                Some(json!({ "student_id": "S-1", "first_name": "New", "last_name": "Person" })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);
        let body = json_body(res).await;
        assert_eq!(body["error"], "Student ID S-1 already exists");
    }

    #[tokio::test]
    async fn enroll_then_enroll_again_conflicts() {
        let (app, store) = app().await;
        store.add_student("S-1", "Ana", "Reyes").await;

        let res = app
            .clone()
            .oneshot(request("POST", "/students/S-1/enroll", Some(json!({ "course_id": 8 }))))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["message"], "Student Ana Reyes enrolled in Risk Management successfully");
        assert_eq!(body["competency_assessment"]["attempt"], 1);

        let res = app
            .clone()
            .oneshot(request("POST", "/students/S-1/enroll", Some(json!({ "course_id": 8 }))))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let res = app
            .oneshot(request("POST", "/students/S-1/enroll", Some(json!({}))))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_list_detail_and_delete() {
        let (app, store) = app().await;
        store.add_student("S-1", "Ana", "Reyes").await;

        let res = app
            .clone()
            .oneshot(request(
                "PUT",
                "/students/S-1",
                Some(json!({ "mode": "addCourse", "course_id": 7 })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["message"], "Course added successfully");

        let res = app
            .clone()
            .oneshot(request("PUT", "/students/S-1", Some(json!({ "goals": "consistency" }))))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["message"], "Student updated successfully");

        let res = app
            .clone()
            .oneshot(request("GET", "/students?q=reyes", None))
            .await
            .unwrap();
        let body = json_body(res).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["course_names"], "Price Action");
        assert_eq!(body[0]["goals"], "consistency");

        let res = app
            .clone()
            .oneshot(request("GET", "/students/S-1", None))
            .await
            .unwrap();
        let body = json_body(res).await;
        assert_eq!(body["enrolled_courses"][0]["course_id"], 7);

        let res = app
            .clone()
            .oneshot(request("GET", "/students/S-1/courses/7/competency", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["completion_rate"], 0.0);

        let res = app
            .clone()
            .oneshot(request("DELETE", "/students/S-1", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["affectedRows"], 1);

        let res = app
            .oneshot(request("DELETE", "/students/S-1", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn duplicate_check_requires_names() {
        let (app, store) = app().await;
        store.add_student("S-1", "Ana", "Reyes").await;

        let res = app
            .clone()
            .oneshot(request("GET", "/students/check-duplicates?first_name=ana&last_name=REYES", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["count"], 1);

        let res = app
            .oneshot(request("GET", "/students/check-duplicates?first_name=ana", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn recording_a_passing_score() {
        let (app, store) = app().await;
        store.add_competency_type(1, "Basic", 75.0).await;
        store.add_student("S-1", "Ana", "Reyes").await;
        let res = app
            .clone()
            .oneshot(request("POST", "/students/S-1/enroll", Some(json!({ "course_id": 7 }))))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .oneshot(request(
                "POST",
                "/students/competency-assessments",
                Some(json!({
                    "student_id": "S-1",
                    "course_id": 7,
                    "competency_type_id": 1,
                    "score": 80
                })),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let body = json_body(res).await;
        assert_eq!(body["assessment"]["attempt_number"], 2);
        assert_eq!(body["assessment"]["status"], "completed");
        assert_eq!(body["assessment"]["is_passed"], true);
    }
}
