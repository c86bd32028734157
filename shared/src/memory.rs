//! In-process [`Store`] backing the workflow and HTTP tests.
//!
//! A session holds the store lock for its whole lifetime and works on a copy
//! of the tables, so sessions are serialized and a rollback simply drops the
//! copy. Primary keys, unique constraints and foreign keys of the Postgres
//! schema are checked on write and reported as storage errors.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::dto::{
    DuplicateCandidate, DuplicateQuery, EnrolledCourse, ExamStatus, StudentFilter, StudentPatch,
    StudentRecord,
};
use crate::error::{AppError, Result};
use crate::store::{
    AssessmentRow, CompetencyType, Course, NewAccount, NewAssessment, NewBatch, NewStudent,
    Session, Store,
};

#[derive(Debug, Clone, PartialEq)]
pub struct AccountRow {
    pub account_id: i64,
    pub username: String,
    pub email: String,
    pub role_id: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchRow {
    pub batch_id: i64,
    pub course_id: i64,
    pub batch_name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentRow {
    pub student_id: String,
    pub course_id: i64,
    pub enrollment_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentRecord {
    pub assessment_id: i64,
    pub student_id: String,
    pub course_id: i64,
    pub competency_type_id: i64,
    pub attempt_number: i32,
    pub score: f64,
    pub passing_score: f64,
    pub exam_status: ExamStatus,
    pub assessment_date: NaiveDate,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub accounts: Vec<AccountRow>,
    pub students: Vec<StudentRecord>,
    pub courses: Vec<Course>,
    pub batches: Vec<BatchRow>,
    pub enrollments: Vec<EnrollmentRow>,
    pub competency_types: Vec<CompetencyType>,
    pub assessments: Vec<AssessmentRecord>,
}

fn next_id(ids: impl Iterator<Item = i64>) -> i64 {
    ids.max().unwrap_or(0) + 1
}

fn violation(constraint: &str) -> AppError {
    AppError::storage(format!("constraint violation: {constraint}"))
}

impl Tables {
    fn has_student(&self, student_id: &str) -> bool {
        self.students.iter().any(|s| s.student_id == student_id)
    }

    fn has_course(&self, course_id: i64) -> bool {
        self.courses.iter().any(|c| c.course_id == course_id)
    }

    fn has_batch(&self, batch_id: i64) -> bool {
        self.batches.iter().any(|b| b.batch_id == batch_id)
    }

    fn email_of(&self, account_id: i64) -> Option<&str> {
        self.accounts
            .iter()
            .find(|a| a.account_id == account_id)
            .map(|a| a.email.as_str())
    }

    fn course_name(&self, course_id: i64) -> Option<&str> {
        self.courses
            .iter()
            .find(|c| c.course_id == course_id)
            .map(|c| c.course_name.as_str())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed tables.
    pub async fn snapshot(&self) -> Tables {
        self.tables.lock().await.clone()
    }

    pub async fn add_course(&self, course_id: i64, course_name: &str) {
        self.tables.lock().await.courses.push(Course {
            course_id,
            course_name: course_name.to_string(),
        });
    }

    pub async fn add_competency_type(&self, type_id: i64, type_name: &str, passing_score: f64) {
        self.tables.lock().await.competency_types.push(CompetencyType {
            type_id,
            type_name: type_name.to_string(),
            passing_score,
        });
    }

    pub async fn add_batch(
        &self,
        course_id: i64,
        batch_name: &str,
        is_active: bool,
        created_at: DateTime<Utc>,
    ) -> i64 {
        let mut tables = self.tables.lock().await;
        let batch_id = next_id(tables.batches.iter().map(|b| b.batch_id));
        let day = created_at.date_naive();
        tables.batches.push(BatchRow {
            batch_id,
            course_id,
            batch_name: batch_name.to_string(),
            start_date: day,
            end_date: day,
            is_active,
            created_at,
        });
        batch_id
    }

    /// Adds a student with a matching account and no batch.
    pub async fn add_student(&self, student_id: &str, first_name: &str, last_name: &str) {
        let mut tables = self.tables.lock().await;
        let account_id = next_id(tables.accounts.iter().map(|a| a.account_id));
        let username = student_id.to_lowercase();
        tables.accounts.push(AccountRow {
            account_id,
            email: format!("{username}@seed.local"),
            username,
            role_id: 1,
            is_active: true,
        });
        let now = Utc::now();
        tables.students.push(StudentRecord {
            student_id: student_id.to_string(),
            account_id,
            first_name: first_name.to_string(),
            middle_name: None,
            last_name: last_name.to_string(),
            age: None,
            gender: None,
            batch_id: None,
            birth_date: None,
            birth_place: None,
            phone_number: None,
            address: None,
            background: None,
            goals: None,
            trading_level_id: None,
            learning_style_id: None,
            device_availability: None,
            rating: Some(0.0),
            is_graduated: false,
            eligibility_status: None,
            graduation_date: None,
            created_at: now,
            updated_at: now,
        });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Session>> {
        let guard = self.tables.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemorySession { guard, work }))
    }
}

pub struct MemorySession {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
}

fn set<T: Clone>(target: &mut T, value: &Option<T>) {
    if let Some(v) = value {
        *target = v.clone();
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

fn same_text(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

#[async_trait]
impl Session for MemorySession {
    async fn student_exists(&mut self, student_id: &str) -> Result<bool> {
        Ok(self.work.has_student(student_id))
    }

    async fn find_student(&mut self, student_id: &str) -> Result<Option<StudentRecord>> {
        Ok(self
            .work
            .students
            .iter()
            .find(|s| s.student_id == student_id)
            .cloned())
    }

    async fn insert_student(&mut self, student: &NewStudent) -> Result<()> {
        if self.work.has_student(&student.student_id) {
            return Err(violation("students_pkey"));
        }
        if !self.work.accounts.iter().any(|a| a.account_id == student.account_id) {
            return Err(violation("students_account_id_fkey"));
        }
        self.work.students.push(StudentRecord {
            student_id: student.student_id.clone(),
            account_id: student.account_id,
            first_name: student.first_name.clone(),
            middle_name: student.middle_name.clone(),
            last_name: student.last_name.clone(),
            age: student.age,
            gender: student.gender.clone(),
            batch_id: None,
            birth_date: student.birth_date,
            birth_place: student.birth_place.clone(),
            phone_number: student.phone_number.clone(),
            address: student.address.clone(),
            background: student.background.clone(),
            goals: student.goals.clone(),
            trading_level_id: student.trading_level_id,
            learning_style_id: student.learning_style_id,
            device_availability: student.device_availability.clone(),
            rating: Some(student.rating),
            is_graduated: false,
            eligibility_status: None,
            graduation_date: None,
            created_at: student.created_at,
            updated_at: student.created_at,
        });
        Ok(())
    }

    async fn set_student_batch(&mut self, student_id: &str, batch_id: i64) -> Result<()> {
        if !self.work.has_batch(batch_id) {
            return Err(violation("students_batch_id_fkey"));
        }
        if let Some(student) = self
            .work
            .students
            .iter_mut()
            .find(|s| s.student_id == student_id)
        {
            student.batch_id = Some(batch_id);
        }
        Ok(())
    }

    async fn update_student(
        &mut self,
        student_id: &str,
        patch: &StudentPatch,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        if let Some(Some(batch_id)) = patch.batch_id {
            if !self.work.has_batch(batch_id) {
                return Err(violation("students_batch_id_fkey"));
            }
        }
        if matches!(patch.first_name, Some(None)) || matches!(patch.last_name, Some(None)) {
            return Err(violation("students_name_not_null"));
        }
        let Some(student) = self
            .work
            .students
            .iter_mut()
            .find(|s| s.student_id == student_id)
        else {
            return Ok(0);
        };

        if let Some(Some(first)) = &patch.first_name {
            student.first_name = first.clone();
        }
        if let Some(Some(last)) = &patch.last_name {
            student.last_name = last.clone();
        }
        set(&mut student.middle_name, &patch.middle_name);
        set(&mut student.age, &patch.age);
        set(&mut student.gender, &patch.gender);
        set(&mut student.birth_date, &patch.birth_date);
        set(&mut student.birth_place, &patch.birth_place);
        set(&mut student.phone_number, &patch.phone_number);
        set(&mut student.address, &patch.address);
        set(&mut student.background, &patch.background);
        set(&mut student.goals, &patch.goals);
        set(&mut student.batch_id, &patch.batch_id);
        set(&mut student.trading_level_id, &patch.trading_level_id);
        set(&mut student.learning_style_id, &patch.learning_style_id);
        set(&mut student.device_availability, &patch.device_availability);
        set(&mut student.rating, &patch.rating);
        if let Some(graduated) = patch.is_graduated {
            student.is_graduated = graduated.unwrap_or(false);
        }
        set(&mut student.eligibility_status, &patch.eligibility_status);
        set(&mut student.graduation_date, &patch.graduation_date);
        student.updated_at = now;
        Ok(1)
    }

    async fn delete_student(&mut self, student_id: &str) -> Result<u64> {
        let referenced = self.work.enrollments.iter().any(|e| e.student_id == student_id)
            || self.work.assessments.iter().any(|a| a.student_id == student_id);
        if referenced && self.work.has_student(student_id) {
            return Err(violation("course_enrollees_student_id_fkey"));
        }
        let before = self.work.students.len();
        self.work.students.retain(|s| s.student_id != student_id);
        Ok((before - self.work.students.len()) as u64)
    }

    async fn list_students(&mut self, filter: &StudentFilter) -> Result<Vec<StudentRecord>> {
        let needle = filter
            .q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_lowercase);
        let mut rows: Vec<StudentRecord> = self
            .work
            .students
            .iter()
            .filter(|s| filter.batch_id.is_none() || s.batch_id == filter.batch_id)
            .filter(|s| match &needle {
                None => true,
                Some(q) => {
                    contains_ci(&s.first_name, q)
                        || contains_ci(&s.last_name, q)
                        || contains_ci(&s.student_id, q)
                        || contains_ci(&format!("{} {}", s.first_name, s.last_name), q)
                }
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn find_duplicates(&mut self, query: &DuplicateQuery) -> Result<Vec<DuplicateCandidate>> {
        let first = query.first_name.as_deref().unwrap_or_default();
        let last = query.last_name.as_deref().unwrap_or_default();
        let mut matches: Vec<(DateTime<Utc>, DuplicateCandidate)> = Vec::new();
        for s in &self.work.students {
            if !same_text(&s.first_name, first) || !same_text(&s.last_name, last) {
                continue;
            }
            if query.birth_date.is_some() && s.birth_date != query.birth_date {
                continue;
            }
            let Some(email) = self.work.email_of(s.account_id) else {
                continue;
            };
            if let Some(wanted) = &query.email {
                if !same_text(email, wanted) {
                    continue;
                }
            }
            let mut courses: Vec<&str> = self
                .work
                .enrollments
                .iter()
                .filter(|e| e.student_id == s.student_id)
                .filter_map(|e| self.work.course_name(e.course_id))
                .collect();
            courses.sort_unstable();
            matches.push((
                s.created_at,
                DuplicateCandidate {
                    student_id: s.student_id.clone(),
                    first_name: s.first_name.clone(),
                    middle_name: s.middle_name.clone(),
                    last_name: s.last_name.clone(),
                    birth_date: s.birth_date,
                    email: email.to_string(),
                    enrolled_courses: (!courses.is_empty()).then(|| courses.join(", ")),
                },
            ));
        }
        matches.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(matches.into_iter().map(|(_, c)| c).collect())
    }

    async fn username_taken(&mut self, username: &str) -> Result<bool> {
        Ok(self.work.accounts.iter().any(|a| a.username == username))
    }

    async fn email_taken(&mut self, email: &str) -> Result<bool> {
        Ok(self.work.accounts.iter().any(|a| a.email == email))
    }

    async fn insert_account(&mut self, account: &NewAccount) -> Result<i64> {
        if self.username_taken(&account.username).await? {
            return Err(violation("accounts_username_key"));
        }
        if self.email_taken(&account.email).await? {
            return Err(violation("accounts_email_key"));
        }
        let account_id = next_id(self.work.accounts.iter().map(|a| a.account_id));
        self.work.accounts.push(AccountRow {
            account_id,
            username: account.username.clone(),
            email: account.email.clone(),
            role_id: account.role_id,
            is_active: true,
        });
        Ok(account_id)
    }

    async fn find_course(&mut self, course_id: i64) -> Result<Option<Course>> {
        Ok(self
            .work
            .courses
            .iter()
            .find(|c| c.course_id == course_id)
            .cloned())
    }

    async fn active_batch(&mut self, course_id: i64) -> Result<Option<i64>> {
        Ok(self
            .work
            .batches
            .iter()
            .filter(|b| b.course_id == course_id && b.is_active)
            .max_by_key(|b| (b.created_at, b.batch_id))
            .map(|b| b.batch_id))
    }

    async fn insert_batch(&mut self, batch: &NewBatch) -> Result<i64> {
        if !self.work.has_course(batch.course_id) {
            return Err(violation("batches_course_id_fkey"));
        }
        let batch_id = next_id(self.work.batches.iter().map(|b| b.batch_id));
        self.work.batches.push(BatchRow {
            batch_id,
            course_id: batch.course_id,
            batch_name: batch.batch_name.clone(),
            start_date: batch.start_date,
            end_date: batch.end_date,
            is_active: true,
            created_at: batch.created_at,
        });
        Ok(batch_id)
    }

    async fn current_course(&mut self, student_id: &str) -> Result<Option<i64>> {
        let batch_id = self
            .work
            .students
            .iter()
            .find(|s| s.student_id == student_id)
            .and_then(|s| s.batch_id);
        Ok(batch_id.and_then(|id| {
            self.work
                .batches
                .iter()
                .find(|b| b.batch_id == id)
                .map(|b| b.course_id)
        }))
    }

    async fn is_enrolled(&mut self, student_id: &str, course_id: i64) -> Result<bool> {
        Ok(self
            .work
            .enrollments
            .iter()
            .any(|e| e.student_id == student_id && e.course_id == course_id))
    }

    async fn insert_enrollment(
        &mut self,
        student_id: &str,
        course_id: i64,
        enrollment_date: NaiveDate,
    ) -> Result<()> {
        if !self.work.has_student(student_id) {
            return Err(violation("course_enrollees_student_id_fkey"));
        }
        if !self.work.has_course(course_id) {
            return Err(violation("course_enrollees_course_id_fkey"));
        }
        if self.is_enrolled(student_id, course_id).await? {
            return Err(violation("course_enrollees_pkey"));
        }
        self.work.enrollments.push(EnrollmentRow {
            student_id: student_id.to_string(),
            course_id,
            enrollment_date,
        });
        Ok(())
    }

    async fn enrolled_courses(
        &mut self,
        student_ids: &[String],
    ) -> Result<Vec<(String, EnrolledCourse)>> {
        Ok(self
            .work
            .enrollments
            .iter()
            .filter(|e| student_ids.contains(&e.student_id))
            .filter_map(|e| {
                let course_name = self.work.course_name(e.course_id)?;
                Some((
                    e.student_id.clone(),
                    EnrolledCourse {
                        course_id: e.course_id,
                        course_name: course_name.to_string(),
                        enrollment_date: e.enrollment_date,
                    },
                ))
            })
            .collect())
    }

    async fn delete_enrollments(&mut self, student_id: &str) -> Result<u64> {
        let before = self.work.enrollments.len();
        self.work.enrollments.retain(|e| e.student_id != student_id);
        Ok((before - self.work.enrollments.len()) as u64)
    }

    async fn competency_type_by_name(&mut self, name: &str) -> Result<Option<CompetencyType>> {
        Ok(self
            .work
            .competency_types
            .iter()
            .find(|t| t.type_name == name)
            .cloned())
    }

    async fn competency_type(&mut self, type_id: i64) -> Result<Option<CompetencyType>> {
        Ok(self
            .work
            .competency_types
            .iter()
            .find(|t| t.type_id == type_id)
            .cloned())
    }

    async fn max_attempt(
        &mut self,
        student_id: &str,
        course_id: i64,
        competency_type_id: i64,
    ) -> Result<Option<i32>> {
        Ok(self
            .work
            .assessments
            .iter()
            .filter(|a| {
                a.student_id == student_id
                    && a.course_id == course_id
                    && a.competency_type_id == competency_type_id
            })
            .map(|a| a.attempt_number)
            .max())
    }

    async fn insert_assessment(&mut self, assessment: &NewAssessment) -> Result<i64> {
        if !self.work.has_student(&assessment.student_id) {
            return Err(violation("competency_assessments_student_id_fkey"));
        }
        if !self.work.has_course(assessment.course_id) {
            return Err(violation("competency_assessments_course_id_fkey"));
        }
        let duplicate = self.work.assessments.iter().any(|a| {
            a.student_id == assessment.student_id
                && a.course_id == assessment.course_id
                && a.competency_type_id == assessment.competency_type_id
                && a.attempt_number == assessment.attempt_number
        });
        if duplicate {
            return Err(violation("competency_assessments_attempt_key"));
        }
        let assessment_id = next_id(self.work.assessments.iter().map(|a| a.assessment_id));
        self.work.assessments.push(AssessmentRecord {
            assessment_id,
            student_id: assessment.student_id.clone(),
            course_id: assessment.course_id,
            competency_type_id: assessment.competency_type_id,
            attempt_number: assessment.attempt_number,
            score: assessment.score,
            passing_score: assessment.passing_score,
            exam_status: assessment.exam_status,
            assessment_date: assessment.assessment_date,
            notes: Some(assessment.notes.clone()),
        });
        Ok(assessment_id)
    }

    async fn course_assessments(
        &mut self,
        student_id: &str,
        course_id: i64,
    ) -> Result<Vec<AssessmentRow>> {
        Ok(self
            .work
            .assessments
            .iter()
            .filter(|a| a.student_id == student_id && a.course_id == course_id)
            .map(|a| AssessmentRow {
                competency_type_id: a.competency_type_id,
                type_name: self
                    .work
                    .competency_types
                    .iter()
                    .find(|t| t.type_id == a.competency_type_id)
                    .map(|t| t.type_name.clone())
                    .unwrap_or_else(|| "Unknown".into()),
                attempt_number: a.attempt_number,
                score: a.score,
                passing_score: a.passing_score,
                exam_status: a.exam_status,
            })
            .collect())
    }

    async fn delete_assessments(&mut self, student_id: &str) -> Result<u64> {
        let before = self.work.assessments.len();
        self.work.assessments.retain(|a| a.student_id != student_id);
        Ok((before - self.work.assessments.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemorySession { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
