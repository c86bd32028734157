//! Competency assessments: seeding the placeholder attempt on enrollment,
//! recording scored attempts, and summarizing progress per course.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::context::{Clock, RequestContext};
use crate::dto::{
    AssessmentRecorded, CompetencyProgress, CompetencySummary, ExamStatus, NewAssessmentRequest,
    RecordedAssessment,
};
use crate::error::{AppError, Result};
use crate::store::{finish, CompetencyType, NewAssessment, Session, Store};

/// Competency type seeded on enrollment, and the values used when that type
/// is missing from the reference table.
#[derive(Debug, Clone, PartialEq)]
pub struct CompetencyDefaults {
    pub type_name: String,
    pub fallback_type_id: i64,
    pub fallback_passing_score: f64,
}

impl Default for CompetencyDefaults {
    fn default() -> Self {
        Self {
            type_name: "Basic".into(),
            fallback_type_id: 1,
            fallback_passing_score: 75.0,
        }
    }
}

/// Why a placeholder attempt is seeded; ends up in the assessment notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedReason {
    StudentCreated,
    CourseAdded,
    Enrolled,
    CourseChanged,
}

impl SeedReason {
    fn note(self, type_name: &str, course_id: i64, attempt: i32) -> String {
        match self {
            SeedReason::StudentCreated => {
                format!("Initial {type_name} competency assessment for course {course_id}")
            }
            SeedReason::CourseAdded => format!(
                "Initial {type_name} competency assessment for course {course_id} (added via update)"
            ),
            SeedReason::Enrolled => {
                format!("Initial {type_name} competency assessment for new course enrollment")
            }
            SeedReason::CourseChanged => format!(
                "{type_name} competency assessment for course change (attempt {attempt})"
            ),
        }
    }
}

/// Descriptive fields of a seeded attempt, as returned to API callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeededAssessment {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(skip)]
    pub type_id: i64,
    pub course_id: i64,
    pub score: f64,
    pub status: ExamStatus,
    pub attempt: i32,
    #[serde(skip)]
    pub passing_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub course_name: Option<String>,
}

async fn seed_type(session: &mut dyn Session, defaults: &CompetencyDefaults) -> Result<CompetencyType> {
    if let Some(found) = session.competency_type_by_name(&defaults.type_name).await? {
        return Ok(found);
    }
    warn!(
        type_name = %defaults.type_name,
        fallback_type_id = defaults.fallback_type_id,
        "competency type missing, using configured fallback"
    );
    Ok(CompetencyType {
        type_id: defaults.fallback_type_id,
        type_name: defaults.type_name.clone(),
        passing_score: defaults.fallback_passing_score,
    })
}

async fn next_attempt(
    session: &mut dyn Session,
    student_id: &str,
    course_id: i64,
    type_id: i64,
) -> Result<i32> {
    let last = session.max_attempt(student_id, course_id, type_id).await?;
    Ok(last.unwrap_or(0) + 1)
}

/// Inserts a failing placeholder attempt for the student in the course.
///
/// Each call adds a new attempt numbered after the highest existing one for
/// the same student, course and competency type.
pub async fn seed_assessment(
    session: &mut dyn Session,
    student_id: &str,
    course_id: i64,
    defaults: &CompetencyDefaults,
    reason: SeedReason,
    clock: &Clock,
) -> Result<SeededAssessment> {
    let kind = seed_type(session, defaults).await?;
    let attempt = next_attempt(session, student_id, course_id, kind.type_id).await?;
    let row = NewAssessment {
        student_id: student_id.to_string(),
        course_id,
        competency_type_id: kind.type_id,
        attempt_number: attempt,
        score: 0.0,
        passing_score: kind.passing_score,
        exam_status: ExamStatus::Failed,
        assessment_date: clock.today,
        notes: reason.note(&kind.type_name, course_id, attempt),
    };
    session.insert_assessment(&row).await?;
    debug!(student_id, course_id, attempt, "seeded competency assessment");

    Ok(SeededAssessment {
        type_name: kind.type_name,
        type_id: kind.type_id,
        course_id,
        score: row.score,
        status: row.exam_status,
        attempt,
        passing_score: kind.passing_score,
        course_name: None,
    })
}

async fn record_in(
    session: &mut dyn Session,
    ctx: &RequestContext,
    req: NewAssessmentRequest,
) -> Result<AssessmentRecorded> {
    let student_id = req.student_id.as_deref().map(str::trim).unwrap_or_default();
    let (Some(course_id), Some(type_id)) = (req.course_id, req.competency_type_id) else {
        return Err(AppError::validation(
            "student_id, course_id, and competency_type_id are required",
        ));
    };
    if student_id.is_empty() {
        return Err(AppError::validation(
            "student_id, course_id, and competency_type_id are required",
        ));
    }

    if !session.is_enrolled(student_id, course_id).await? {
        return Err(AppError::validation("Student is not enrolled in this course"));
    }
    let Some(kind) = session.competency_type(type_id).await? else {
        return Err(AppError::validation("Invalid competency type"));
    };

    let score = req.score.unwrap_or(0.0);
    let status = ExamStatus::for_score(score, kind.passing_score);
    let attempt = next_attempt(session, student_id, course_id, type_id).await?;
    let notes = crate::dto::clean(req.notes.as_deref()).unwrap_or_else(|| {
        format!("{} competency assessment attempt {attempt}", kind.type_name)
    });

    session
        .insert_assessment(&NewAssessment {
            student_id: student_id.to_string(),
            course_id,
            competency_type_id: type_id,
            attempt_number: attempt,
            score,
            passing_score: kind.passing_score,
            exam_status: status,
            assessment_date: ctx.clock.today,
            notes,
        })
        .await?;

    Ok(AssessmentRecorded {
        message: "Competency assessment added successfully".into(),
        assessment: RecordedAssessment {
            student_id: student_id.to_string(),
            course_id,
            competency_type: kind.type_name,
            attempt_number: attempt,
            score,
            passing_score: kind.passing_score,
            status,
            is_passed: status == ExamStatus::Completed,
        },
    })
}

/// Records a scored attempt for an enrolled student.
pub async fn record_assessment(
    store: &dyn Store,
    ctx: &RequestContext,
    req: NewAssessmentRequest,
) -> Result<AssessmentRecorded> {
    let mut session = store.begin().await?;
    let outcome = record_in(session.as_mut(), ctx, req).await;
    finish(session, outcome).await
}

/// Per competency type summary of a student's attempts in a course.
pub async fn course_progress(
    store: &dyn Store,
    student_id: &str,
    course_id: i64,
) -> Result<CompetencyProgress> {
    let mut session = store.begin().await?;
    let outcome = session.course_assessments(student_id, course_id).await;
    let rows = finish(session, outcome).await?;
    if rows.is_empty() {
        return Err(AppError::not_found(
            "No competency data found for this student and course",
        ));
    }

    let mut by_type: BTreeMap<i64, Vec<_>> = BTreeMap::new();
    for row in rows {
        by_type.entry(row.competency_type_id).or_default().push(row);
    }

    let competencies: Vec<CompetencySummary> = by_type
        .into_iter()
        .filter_map(|(type_id, mut attempts)| {
            attempts.sort_by_key(|a| a.attempt_number);
            let latest = attempts.last()?;
            let best_score = attempts.iter().map(|a| a.score).fold(f64::MIN, f64::max);
            Some(CompetencySummary {
                competency_type_id: type_id,
                competency_type: latest.type_name.clone(),
                passing_score: latest.passing_score,
                attempts: attempts.len() as i32,
                best_score,
                latest_status: latest.exam_status,
                is_passed: attempts.iter().any(|a| a.exam_status == ExamStatus::Completed),
            })
        })
        .collect();

    let passed = competencies.iter().filter(|c| c.is_passed).count();
    let completion_rate = (passed as f64 * 10_000.0 / competencies.len() as f64).round() / 100.0;

    Ok(CompetencyProgress {
        student_id: student_id.to_string(),
        course_id,
        competencies,
        completion_rate,
    })
}
