//! Storage seam of the workflows.
//!
//! A [`Store`] hands out one [`Session`] per workflow invocation. A session is
//! a transaction: its writes are visible to its own reads, invisible to other
//! sessions until [`Session::commit`], and discarded by [`Session::rollback`]
//! or by dropping the session.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::warn;

use crate::dto::{
    DuplicateCandidate, DuplicateQuery, EnrolledCourse, ExamStatus, StudentFilter, StudentPatch,
    StudentRecord,
};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Course {
    pub course_id: i64,
    pub course_name: String,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CompetencyType {
    pub type_id: i64,
    pub type_name: String,
    pub passing_score: f64,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub role_id: i64,
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub student_id: String,
    pub account_id: i64,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub age: Option<i32>,
    pub gender: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub birth_place: Option<String>,
    pub phone_number: Option<String>,
    pub address: Option<String>,
    pub background: Option<String>,
    pub goals: Option<String>,
    pub trading_level_id: Option<i64>,
    pub learning_style_id: Option<i64>,
    pub device_availability: Option<String>,
    pub rating: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewBatch {
    pub course_id: i64,
    pub batch_name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAssessment {
    pub student_id: String,
    pub course_id: i64,
    pub competency_type_id: i64,
    pub attempt_number: i32,
    pub score: f64,
    pub passing_score: f64,
    pub exam_status: ExamStatus,
    pub assessment_date: NaiveDate,
    pub notes: String,
}

/// One assessment of a student/course joined with its competency type name.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentRow {
    pub competency_type_id: i64,
    pub type_name: String,
    pub attempt_number: i32,
    pub score: f64,
    pub passing_score: f64,
    pub exam_status: ExamStatus,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Session>>;
}

#[async_trait]
pub trait Session: Send {
    /* students */
    async fn student_exists(&mut self, student_id: &str) -> Result<bool>;
    async fn find_student(&mut self, student_id: &str) -> Result<Option<StudentRecord>>;
    async fn insert_student(&mut self, student: &NewStudent) -> Result<()>;
    async fn set_student_batch(&mut self, student_id: &str, batch_id: i64) -> Result<()>;
    /// Applies every present patch field and refreshes `updated_at`.
    async fn update_student(
        &mut self,
        student_id: &str,
        patch: &StudentPatch,
        now: DateTime<Utc>,
    ) -> Result<u64>;
    async fn delete_student(&mut self, student_id: &str) -> Result<u64>;
    async fn list_students(&mut self, filter: &StudentFilter) -> Result<Vec<StudentRecord>>;
    async fn find_duplicates(&mut self, query: &DuplicateQuery) -> Result<Vec<DuplicateCandidate>>;

    /* accounts */
    async fn username_taken(&mut self, username: &str) -> Result<bool>;
    async fn email_taken(&mut self, email: &str) -> Result<bool>;
    async fn insert_account(&mut self, account: &NewAccount) -> Result<i64>;

    /* courses and batches */
    async fn find_course(&mut self, course_id: i64) -> Result<Option<Course>>;
    /// Most recently created active batch of the course.
    async fn active_batch(&mut self, course_id: i64) -> Result<Option<i64>>;
    async fn insert_batch(&mut self, batch: &NewBatch) -> Result<i64>;
    /// Course of the batch the student is assigned to, if any.
    async fn current_course(&mut self, student_id: &str) -> Result<Option<i64>>;

    /* enrollments */
    async fn is_enrolled(&mut self, student_id: &str, course_id: i64) -> Result<bool>;
    async fn insert_enrollment(
        &mut self,
        student_id: &str,
        course_id: i64,
        enrollment_date: NaiveDate,
    ) -> Result<()>;
    async fn enrolled_courses(
        &mut self,
        student_ids: &[String],
    ) -> Result<Vec<(String, EnrolledCourse)>>;
    async fn delete_enrollments(&mut self, student_id: &str) -> Result<u64>;

    /* competency */
    async fn competency_type_by_name(&mut self, name: &str) -> Result<Option<CompetencyType>>;
    async fn competency_type(&mut self, type_id: i64) -> Result<Option<CompetencyType>>;
    async fn max_attempt(
        &mut self,
        student_id: &str,
        course_id: i64,
        competency_type_id: i64,
    ) -> Result<Option<i32>>;
    async fn insert_assessment(&mut self, assessment: &NewAssessment) -> Result<i64>;
    async fn course_assessments(
        &mut self,
        student_id: &str,
        course_id: i64,
    ) -> Result<Vec<AssessmentRow>>;
    async fn delete_assessments(&mut self, student_id: &str) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Ends a workflow's transaction: commits on `Ok`, rolls back on `Err`.
///
/// Every workflow passes its session through here exactly once.
pub async fn finish<T>(session: Box<dyn Session>, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            session.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = session.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}
