//! Postgres-backed [`Store`].
//!
//! Each session wraps one `sqlx` transaction. Queries are built at runtime so
//! the crate compiles without a live database.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use tracing::{error, info, warn};

use crate::config::{ensure_sslmode_disable, Settings};
use crate::dto::{
    DuplicateCandidate, DuplicateQuery, EnrolledCourse, ExamStatus, StudentFilter, StudentPatch,
    StudentRecord,
};
use crate::error::{AppError, Result};
use crate::store::{
    AssessmentRow, CompetencyType, Course, NewAccount, NewAssessment, NewBatch, NewStudent,
    Session, Store,
};

const SCHEMA: &[(&str, &str)] = &[
    (
        "accounts",
        "CREATE TABLE IF NOT EXISTS accounts (
            account_id BIGSERIAL PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            role_id BIGINT NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    ),
    (
        "courses",
        "CREATE TABLE IF NOT EXISTS courses (
            course_id BIGSERIAL PRIMARY KEY,
            course_name TEXT NOT NULL
        )",
    ),
    (
        "batches",
        "CREATE TABLE IF NOT EXISTS batches (
            batch_id BIGSERIAL PRIMARY KEY,
            course_id BIGINT NOT NULL REFERENCES courses(course_id),
            batch_name TEXT NOT NULL,
            start_date DATE NOT NULL,
            end_date DATE NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    ),
    (
        "students",
        "CREATE TABLE IF NOT EXISTS students (
            student_id VARCHAR(20) PRIMARY KEY,
            account_id BIGINT NOT NULL REFERENCES accounts(account_id),
            first_name TEXT NOT NULL,
            middle_name TEXT,
            last_name TEXT NOT NULL,
            age INT,
            gender TEXT,
            batch_id BIGINT REFERENCES batches(batch_id),
            birth_date DATE,
            birth_place TEXT,
            phone_number TEXT,
            address TEXT,
            background TEXT,
            goals TEXT,
            trading_level_id BIGINT,
            learning_style_id BIGINT,
            device_availability TEXT,
            rating DOUBLE PRECISION DEFAULT 0,
            is_graduated BOOLEAN NOT NULL DEFAULT FALSE,
            eligibility_status TEXT,
            graduation_date DATE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    ),
    (
        "course_enrollees",
        "CREATE TABLE IF NOT EXISTS course_enrollees (
            student_id VARCHAR(20) NOT NULL REFERENCES students(student_id),
            course_id BIGINT NOT NULL REFERENCES courses(course_id),
            enrollment_date DATE NOT NULL,
            PRIMARY KEY (student_id, course_id)
        )",
    ),
    (
        "competency_types",
        "CREATE TABLE IF NOT EXISTS competency_types (
            type_id BIGSERIAL PRIMARY KEY,
            type_name TEXT NOT NULL UNIQUE,
            passing_score DOUBLE PRECISION NOT NULL
        )",
    ),
    (
        "competency_assessments",
        "CREATE TABLE IF NOT EXISTS competency_assessments (
            assessment_id BIGSERIAL PRIMARY KEY,
            student_id VARCHAR(20) NOT NULL REFERENCES students(student_id),
            course_id BIGINT NOT NULL REFERENCES courses(course_id),
            competency_type_id BIGINT NOT NULL,
            attempt_number INT NOT NULL,
            score DOUBLE PRECISION NOT NULL,
            passing_score DOUBLE PRECISION NOT NULL,
            exam_status TEXT NOT NULL,
            assessment_date DATE NOT NULL,
            notes TEXT,
            UNIQUE (student_id, course_id, competency_type_id, attempt_number)
        )",
    ),
];

const STUDENT_COLUMNS: &str = "s.student_id, s.account_id, s.first_name, s.middle_name, \
    s.last_name, s.age, s.gender, s.batch_id, s.birth_date, s.birth_place, s.phone_number, \
    s.address, s.background, s.goals, s.trading_level_id, s.learning_style_id, \
    s.device_availability, s.rating, s.is_graduated, s.eligibility_status, s.graduation_date, \
    s.created_at, s.updated_at";

/// Logs a failed statement and turns it into a storage error.
fn failed(op: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| {
        error!(%e, op, "query failed");
        AppError::from(e)
    }
}

fn exam_status(raw: &str) -> Result<ExamStatus> {
    raw.parse()
        .map_err(|_| AppError::storage(format!("unknown exam_status '{raw}'")))
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(settings: &Settings) -> Result<Self> {
        let url = ensure_sslmode_disable(&settings.database_url);
        if url != settings.database_url {
            warn!("DATABASE_URL had no sslmode – using '{}'", url);
        }
        let pool = PgPoolOptions::new()
            .max_connections(settings.db_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await
            .map_err(|e| {
                error!(%e, "failed to connect to Postgres");
                AppError::from(e)
            })?;
        Ok(Self { pool })
    }

    /// Creates the tables used by the workflows if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        for (table, ddl) in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await.map_err(|e| {
                error!(%e, table, "creating table failed");
                AppError::from(e)
            })?;
        }
        info!(tables = SCHEMA.len(), "schema ready");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Session>> {
        let tx = self.pool.begin().await.map_err(failed("begin"))?;
        Ok(Box::new(PgSession { tx }))
    }
}

pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

fn set_column<'a, T>(qb: &mut QueryBuilder<'a, Postgres>, column: &str, value: &Option<Option<T>>)
where
    T: 'a + Clone + Send + sqlx::Encode<'a, Postgres> + sqlx::Type<Postgres>,
{
    if let Some(value) = value {
        qb.push(", ").push(column).push(" = ").push_bind(value.clone());
    }
}

/// `UPDATE students` touching only the columns present in the patch.
fn update_query(
    student_id: &str,
    patch: &StudentPatch,
    now: DateTime<Utc>,
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("UPDATE students SET updated_at = ");
    qb.push_bind(now);
    set_column(&mut qb, "first_name", &patch.first_name);
    set_column(&mut qb, "middle_name", &patch.middle_name);
    set_column(&mut qb, "last_name", &patch.last_name);
    set_column(&mut qb, "age", &patch.age);
    set_column(&mut qb, "gender", &patch.gender);
    set_column(&mut qb, "birth_date", &patch.birth_date);
    set_column(&mut qb, "birth_place", &patch.birth_place);
    set_column(&mut qb, "phone_number", &patch.phone_number);
    set_column(&mut qb, "address", &patch.address);
    set_column(&mut qb, "background", &patch.background);
    set_column(&mut qb, "goals", &patch.goals);
    set_column(&mut qb, "batch_id", &patch.batch_id);
    set_column(&mut qb, "trading_level_id", &patch.trading_level_id);
    set_column(&mut qb, "learning_style_id", &patch.learning_style_id);
    set_column(&mut qb, "device_availability", &patch.device_availability);
    set_column(&mut qb, "rating", &patch.rating);
    if let Some(graduated) = patch.is_graduated {
        qb.push(", is_graduated = ").push_bind(graduated.unwrap_or(false));
    }
    set_column(&mut qb, "eligibility_status", &patch.eligibility_status);
    set_column(&mut qb, "graduation_date", &patch.graduation_date);
    qb.push(" WHERE student_id = ").push_bind(student_id.to_string());
    qb
}

#[async_trait]
impl Session for PgSession {
    async fn student_exists(&mut self, student_id: &str) -> Result<bool> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT student_id FROM students WHERE student_id = $1")
                .bind(student_id)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(failed("student_exists"))?;
        Ok(found.is_some())
    }

    async fn find_student(&mut self, student_id: &str) -> Result<Option<StudentRecord>> {
        let sql = format!("SELECT {STUDENT_COLUMNS} FROM students s WHERE s.student_id = $1");
        sqlx::query_as::<_, StudentRecord>(&sql)
            .bind(student_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed("find_student"))
    }

    async fn insert_student(&mut self, s: &NewStudent) -> Result<()> {
        sqlx::query(
            "INSERT INTO students (
                student_id, account_id, first_name, middle_name, last_name, age, gender,
                birth_date, birth_place, phone_number, address, background, goals,
                trading_level_id, learning_style_id, device_availability, rating,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $18)",
        )
        .bind(&s.student_id)
        .bind(s.account_id)
        .bind(&s.first_name)
        .bind(&s.middle_name)
        .bind(&s.last_name)
        .bind(s.age)
        .bind(&s.gender)
        .bind(s.birth_date)
        .bind(&s.birth_place)
        .bind(&s.phone_number)
        .bind(&s.address)
        .bind(&s.background)
        .bind(&s.goals)
        .bind(s.trading_level_id)
        .bind(s.learning_style_id)
        .bind(&s.device_availability)
        .bind(s.rating)
        .bind(s.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(failed("insert_student"))?;
        Ok(())
    }

    async fn set_student_batch(&mut self, student_id: &str, batch_id: i64) -> Result<()> {
        sqlx::query("UPDATE students SET batch_id = $1 WHERE student_id = $2")
            .bind(batch_id)
            .bind(student_id)
            .execute(&mut *self.tx)
            .await
            .map_err(failed("set_student_batch"))?;
        Ok(())
    }

    async fn update_student(
        &mut self,
        student_id: &str,
        patch: &StudentPatch,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut qb = update_query(student_id, patch, now);
        let done = qb
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(failed("update_student"))?;
        Ok(done.rows_affected())
    }

    async fn delete_student(&mut self, student_id: &str) -> Result<u64> {
        let done = sqlx::query("DELETE FROM students WHERE student_id = $1")
            .bind(student_id)
            .execute(&mut *self.tx)
            .await
            .map_err(failed("delete_student"))?;
        Ok(done.rows_affected())
    }

    async fn list_students(&mut self, filter: &StudentFilter) -> Result<Vec<StudentRecord>> {
        let q = filter
            .q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty());
        let sql = format!(
            "SELECT {STUDENT_COLUMNS} FROM students s
              WHERE ($1::bigint IS NULL OR s.batch_id = $1)
                AND ($2::text IS NULL
                     OR s.first_name ILIKE '%' || $2 || '%'
                     OR s.last_name ILIKE '%' || $2 || '%'
                     OR s.student_id ILIKE '%' || $2 || '%'
                     OR (s.first_name || ' ' || s.last_name) ILIKE '%' || $2 || '%')
              ORDER BY s.created_at DESC"
        );
        sqlx::query_as::<_, StudentRecord>(&sql)
            .bind(filter.batch_id)
            .bind(q)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(failed("list_students"))
    }

    async fn find_duplicates(&mut self, query: &DuplicateQuery) -> Result<Vec<DuplicateCandidate>> {
        sqlx::query_as::<_, DuplicateCandidate>(
            "SELECT s.student_id, s.first_name, s.middle_name, s.last_name, s.birth_date, a.email,
                    string_agg(c.course_name, ', ' ORDER BY c.course_name) AS enrolled_courses
               FROM students s
               JOIN accounts a ON a.account_id = s.account_id
               LEFT JOIN course_enrollees ce ON ce.student_id = s.student_id
               LEFT JOIN courses c ON c.course_id = ce.course_id
              WHERE LOWER(TRIM(s.first_name)) = LOWER(TRIM($1))
                AND LOWER(TRIM(s.last_name)) = LOWER(TRIM($2))
                AND ($3::date IS NULL OR s.birth_date = $3)
                AND ($4::text IS NULL OR LOWER(TRIM(a.email)) = LOWER(TRIM($4)))
              GROUP BY s.student_id, a.email
              ORDER BY s.created_at DESC",
        )
        .bind(query.first_name.as_deref().unwrap_or_default())
        .bind(query.last_name.as_deref().unwrap_or_default())
        .bind(query.birth_date)
        .bind(query.email.as_deref())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(failed("find_duplicates"))
    }

    async fn username_taken(&mut self, username: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT account_id FROM accounts WHERE username = $1")
                .bind(username)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(failed("username_taken"))?;
        Ok(found.is_some())
    }

    async fn email_taken(&mut self, email: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT account_id FROM accounts WHERE email = $1")
            .bind(email)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed("email_taken"))?;
        Ok(found.is_some())
    }

    async fn insert_account(&mut self, account: &NewAccount) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO accounts (username, email, role_id, is_active)
             VALUES ($1, $2, $3, TRUE) RETURNING account_id",
        )
        .bind(&account.username)
        .bind(&account.email)
        .bind(account.role_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(failed("insert_account"))
    }

    async fn find_course(&mut self, course_id: i64) -> Result<Option<Course>> {
        sqlx::query_as::<_, Course>("SELECT course_id, course_name FROM courses WHERE course_id = $1")
            .bind(course_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(failed("find_course"))
    }

    async fn active_batch(&mut self, course_id: i64) -> Result<Option<i64>> {
        sqlx::query_scalar(
            "SELECT batch_id FROM batches
              WHERE course_id = $1 AND is_active
              ORDER BY created_at DESC, batch_id DESC
              LIMIT 1",
        )
        .bind(course_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(failed("active_batch"))
    }

    async fn insert_batch(&mut self, batch: &NewBatch) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO batches (course_id, batch_name, start_date, end_date, is_active, created_at)
             VALUES ($1, $2, $3, $4, TRUE, $5) RETURNING batch_id",
        )
        .bind(batch.course_id)
        .bind(&batch.batch_name)
        .bind(batch.start_date)
        .bind(batch.end_date)
        .bind(batch.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(failed("insert_batch"))
    }

    async fn current_course(&mut self, student_id: &str) -> Result<Option<i64>> {
        sqlx::query_scalar(
            "SELECT b.course_id FROM students s
               JOIN batches b ON b.batch_id = s.batch_id
              WHERE s.student_id = $1",
        )
        .bind(student_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(failed("current_course"))
    }

    async fn is_enrolled(&mut self, student_id: &str, course_id: i64) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT course_id FROM course_enrollees WHERE student_id = $1 AND course_id = $2",
        )
        .bind(student_id)
        .bind(course_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(failed("is_enrolled"))?;
        Ok(found.is_some())
    }

    async fn insert_enrollment(
        &mut self,
        student_id: &str,
        course_id: i64,
        enrollment_date: NaiveDate,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO course_enrollees (student_id, course_id, enrollment_date) VALUES ($1, $2, $3)",
        )
        .bind(student_id)
        .bind(course_id)
        .bind(enrollment_date)
        .execute(&mut *self.tx)
        .await
        .map_err(failed("insert_enrollment"))?;
        Ok(())
    }

    async fn enrolled_courses(
        &mut self,
        student_ids: &[String],
    ) -> Result<Vec<(String, EnrolledCourse)>> {
        let rows: Vec<(String, i64, String, NaiveDate)> = sqlx::query_as(
            "SELECT ce.student_id, c.course_id, c.course_name, ce.enrollment_date
               FROM course_enrollees ce
               JOIN courses c ON c.course_id = ce.course_id
              WHERE ce.student_id = ANY($1)",
        )
        .bind(student_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(failed("enrolled_courses"))?;
        Ok(rows
            .into_iter()
            .map(|(student_id, course_id, course_name, enrollment_date)| {
                (
                    student_id,
                    EnrolledCourse {
                        course_id,
                        course_name,
                        enrollment_date,
                    },
                )
            })
            .collect())
    }

    async fn delete_enrollments(&mut self, student_id: &str) -> Result<u64> {
        let done = sqlx::query("DELETE FROM course_enrollees WHERE student_id = $1")
            .bind(student_id)
            .execute(&mut *self.tx)
            .await
            .map_err(failed("delete_enrollments"))?;
        Ok(done.rows_affected())
    }

    async fn competency_type_by_name(&mut self, name: &str) -> Result<Option<CompetencyType>> {
        sqlx::query_as::<_, CompetencyType>(
            "SELECT type_id, type_name, passing_score FROM competency_types WHERE type_name = $1 LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(failed("competency_type_by_name"))
    }

    async fn competency_type(&mut self, type_id: i64) -> Result<Option<CompetencyType>> {
        sqlx::query_as::<_, CompetencyType>(
            "SELECT type_id, type_name, passing_score FROM competency_types WHERE type_id = $1",
        )
        .bind(type_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(failed("competency_type"))
    }

    async fn max_attempt(
        &mut self,
        student_id: &str,
        course_id: i64,
        competency_type_id: i64,
    ) -> Result<Option<i32>> {
        sqlx::query_scalar(
            "SELECT MAX(attempt_number) FROM competency_assessments
              WHERE student_id = $1 AND course_id = $2 AND competency_type_id = $3",
        )
        .bind(student_id)
        .bind(course_id)
        .bind(competency_type_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(failed("max_attempt"))
    }

    async fn insert_assessment(&mut self, a: &NewAssessment) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO competency_assessments (
                student_id, course_id, competency_type_id, attempt_number, score,
                passing_score, exam_status, assessment_date, notes
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING assessment_id",
        )
        .bind(&a.student_id)
        .bind(a.course_id)
        .bind(a.competency_type_id)
        .bind(a.attempt_number)
        .bind(a.score)
        .bind(a.passing_score)
        .bind(a.exam_status.to_string())
        .bind(a.assessment_date)
        .bind(&a.notes)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(failed("insert_assessment"))
    }

    async fn course_assessments(
        &mut self,
        student_id: &str,
        course_id: i64,
    ) -> Result<Vec<AssessmentRow>> {
        let rows: Vec<(i64, String, i32, f64, f64, String)> = sqlx::query_as(
            "SELECT ca.competency_type_id, COALESCE(ct.type_name, 'Unknown'), ca.attempt_number,
                    ca.score, ca.passing_score, ca.exam_status
               FROM competency_assessments ca
               LEFT JOIN competency_types ct ON ct.type_id = ca.competency_type_id
              WHERE ca.student_id = $1 AND ca.course_id = $2
              ORDER BY ca.competency_type_id, ca.attempt_number",
        )
        .bind(student_id)
        .bind(course_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(failed("course_assessments"))?;
        rows.into_iter()
            .map(
                |(competency_type_id, type_name, attempt_number, score, passing_score, status)| {
                    Ok(AssessmentRow {
                        competency_type_id,
                        type_name,
                        attempt_number,
                        score,
                        passing_score,
                        exam_status: exam_status(&status)?,
                    })
                },
            )
            .collect()
    }

    async fn delete_assessments(&mut self, student_id: &str) -> Result<u64> {
        let done = sqlx::query("DELETE FROM competency_assessments WHERE student_id = $1")
            .bind(student_id)
            .execute(&mut *self.tx)
            .await
            .map_err(failed("delete_assessments"))?;
        Ok(done.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(failed("commit"))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(failed("rollback"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Clock, RequestContext};
    use crate::dto::{NewStudentRequest, UpdateOutcome, UpdateStudentRequest};
    use crate::enrollment::create_student;
    use crate::roster::{delete_student, find_duplicates, get_student, list_students};
    use crate::update::update_student;
    use chrono::TimeZone;

    #[test]
    fn update_touches_only_present_columns() {
        let patch = StudentPatch {
            goals: Some(Some("swing trading".into())),
            middle_name: Some(None),
            is_graduated: Some(None),
            ..Default::default()
        };
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let qb = update_query("S1", &patch, now);
        assert_eq!(
            qb.sql(),
            "UPDATE students SET updated_at = $1, middle_name = $2, goals = $3, \
             is_graduated = $4 WHERE student_id = $5"
        );
    }

    #[test]
    fn empty_patch_only_bumps_updated_at() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let qb = update_query("S1", &StudentPatch::default(), now);
        assert_eq!(
            qb.sql(),
            "UPDATE students SET updated_at = $1 WHERE student_id = $2"
        );
    }

    #[test]
    fn stored_exam_status_parses() {
        assert_eq!(exam_status("failed").unwrap(), ExamStatus::Failed);
        assert!(matches!(exam_status("passed"), Err(AppError::Storage(_))));
    }

    #[test]
    fn schema_creates_parents_before_children() {
        let order: Vec<&str> = SCHEMA.iter().map(|(table, _)| *table).collect();
        let pos = |t: &str| order.iter().position(|o| *o == t).unwrap();
        assert!(pos("accounts") < pos("students"));
        assert!(pos("courses") < pos("batches"));
        assert!(pos("batches") < pos("students"));
        assert!(pos("students") < pos("course_enrollees"));
        assert!(pos("students") < pos("competency_assessments"));
    }

    // The `#[sqlx::test]` cases below get a fresh database from DATABASE_URL.
    fn ctx() -> RequestContext {
        let clock = Clock::fixed(Utc.with_ymd_and_hms(2024, 8, 20, 9, 30, 0).unwrap());
        RequestContext::new(&Settings::default(), clock)
    }

    async fn store_with_catalog(pool: PgPool) -> PgStore {
        let store = PgStore::new(pool);
        store.ensure_schema().await.unwrap();
        sqlx::query("INSERT INTO courses (course_id, course_name) VALUES (1, 'Forex'), (2, 'Crypto')")
            .execute(&store.pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO competency_types (type_id, type_name, passing_score) VALUES (1, 'Basic', 75)",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        store
    }

    fn new_student(id: &str, first: &str, last: &str, course_id: Option<i64>) -> NewStudentRequest {
        NewStudentRequest {
            student_id: Some(id.into()),
            first_name: Some(first.into()),
            last_name: Some(last.into()),
            birth_date: NaiveDate::from_ymd_opt(2000, 3, 15),
            course_id,
            ..Default::default()
        }
    }

    async fn count(store: &PgStore, table: &str, student_id: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE student_id = $1"))
            .bind(student_id)
            .fetch_one(&store.pool)
            .await
            .unwrap()
    }

    #[sqlx::test]
    async fn create_with_course_persists_batch_enrollment_and_seed(pool: PgPool) {
        let store = store_with_catalog(pool).await;
        let created = create_student(&store, &ctx(), new_student("S1", "Ana", "Lim", Some(1)))
            .await
            .unwrap();
        assert_eq!(created.age, Some(24));
        let enrollment = created.enrollment.unwrap();
        assert_eq!(enrollment.course_name, "Forex");

        let (batch_course, batch_name): (i64, String) =
            sqlx::query_as("SELECT course_id, batch_name FROM batches WHERE batch_id = $1")
                .bind(enrollment.batch_id)
                .fetch_one(&store.pool)
                .await
                .unwrap();
        assert_eq!(batch_course, 1);
        assert!(!batch_name.is_empty());
        assert_eq!(count(&store, "course_enrollees", "S1").await, 1);

        let (attempt, status): (i32, String) = sqlx::query_as(
            "SELECT attempt_number, exam_status FROM competency_assessments WHERE student_id = $1",
        )
        .bind("S1")
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!((attempt, status.as_str()), (1, "failed"));

        let detail = get_student(&store, "S1").await.unwrap();
        assert_eq!(detail.student.batch_id, Some(enrollment.batch_id));
        assert_eq!(detail.enrolled_courses.len(), 1);
        assert_eq!(detail.enrolled_courses[0].enrollment_date, ctx().clock.today);

        let listed = list_students(
            &store,
            &StudentFilter {
                q: Some("ana lim".into()),
                batch_id: Some(enrollment.batch_id),
            },
        )
        .await
        .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].course_names, "Forex");

        let err = create_student(&store, &ctx(), new_student("S1", "Ana", "Lim", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[sqlx::test]
    async fn course_change_moves_batch_and_continues_attempts(pool: PgPool) {
        let store = store_with_catalog(pool).await;
        create_student(&store, &ctx(), new_student("S1", "Ana", "Lim", Some(1)))
            .await
            .unwrap();
        let change = |course_id: i64| -> UpdateStudentRequest {
            UpdateStudentRequest {
                course_id: Some(course_id),
                ..Default::default()
            }
        };

        let UpdateOutcome::Updated(result) =
            update_student(&store, &ctx(), "S1", change(2)).await.unwrap()
        else {
            panic!("expected a field update");
        };
        assert_eq!(result.new_competency_assessment.unwrap().attempt, 1);
        let crypto_batch: i64 =
            sqlx::query_scalar("SELECT batch_id FROM batches WHERE course_id = 2")
                .fetch_one(&store.pool)
                .await
                .unwrap();
        let detail = get_student(&store, "S1").await.unwrap();
        assert_eq!(detail.student.batch_id, Some(crypto_batch));
        assert_eq!(count(&store, "course_enrollees", "S1").await, 2);

        let UpdateOutcome::Updated(result) =
            update_student(&store, &ctx(), "S1", change(1)).await.unwrap()
        else {
            panic!("expected a field update");
        };
        assert_eq!(result.new_competency_assessment.unwrap().attempt, 2);
        assert_eq!(count(&store, "course_enrollees", "S1").await, 2);
        assert_eq!(count(&store, "competency_assessments", "S1").await, 3);

        // Same course again is not a change, so nothing is written.
        let err = update_student(&store, &ctx(), "S1", change(1)).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        // Unknown course rolls back the patch that came with it.
        let mut req = change(77);
        req.patch.goals = Some(Some("scalping".into()));
        let err = update_student(&store, &ctx(), "S1", req).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(get_student(&store, "S1").await.unwrap().student.goals, None);
    }

    #[sqlx::test]
    async fn delete_cascades_to_assessments_and_enrollments(pool: PgPool) {
        let store = store_with_catalog(pool).await;
        create_student(&store, &ctx(), new_student("S1", "Ana", "Lim", Some(1)))
            .await
            .unwrap();
        create_student(&store, &ctx(), new_student("S2", "Ben", "Cruz", Some(1)))
            .await
            .unwrap();

        let deleted = delete_student(&store, "S1").await.unwrap();
        assert_eq!(deleted.affected_rows, 1);
        for table in ["students", "course_enrollees", "competency_assessments"] {
            assert_eq!(count(&store, table, "S1").await, 0, "{table}");
            assert_eq!(count(&store, table, "S2").await, 1, "{table}");
        }
        let accounts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(accounts, 2);

        let err = delete_student(&store, "S1").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[sqlx::test]
    async fn duplicate_check_aggregates_courses(pool: PgPool) {
        let store = store_with_catalog(pool).await;
        create_student(&store, &ctx(), new_student("S1", "Jose", "Rizal", Some(2)))
            .await
            .unwrap();
        update_student(
            &store,
            &ctx(),
            "S1",
            UpdateStudentRequest {
                mode: Some("addCourse".into()),
                course_id: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let mut other = new_student("S2", "Jose", "Rizal", None);
        other.birth_date = NaiveDate::from_ymd_opt(1999, 6, 19);
        create_student(&store, &ctx(), other).await.unwrap();

        let query = DuplicateQuery {
            first_name: Some(" jose ".into()),
            last_name: Some("RIZAL".into()),
            ..Default::default()
        };
        let report = find_duplicates(&store, &query).await.unwrap();
        assert_eq!(report.count, 2);
        let s1 = report
            .potential_duplicates
            .iter()
            .find(|c| c.student_id == "S1")
            .unwrap();
        assert_eq!(s1.enrolled_courses.as_deref(), Some("Crypto, Forex"));
        let s2 = report
            .potential_duplicates
            .iter()
            .find(|c| c.student_id == "S2")
            .unwrap();
        assert_eq!(s2.enrolled_courses, None);

        let narrowed = find_duplicates(
            &store,
            &DuplicateQuery {
                birth_date: NaiveDate::from_ymd_opt(2000, 3, 15),
                email: Some(s1.email.to_uppercase()),
                ..query
            },
        )
        .await
        .unwrap();
        assert_eq!(narrowed.count, 1);
        assert_eq!(narrowed.potential_duplicates[0].student_id, "S1");
    }
}
