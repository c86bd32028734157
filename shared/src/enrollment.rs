//! Student creation and course enrollment.

use tracing::{debug, info};

use crate::age::calculate_age;
use crate::batch::resolve_batch;
use crate::competency::{seed_assessment, SeedReason, SeededAssessment};
use crate::context::RequestContext;
use crate::dto::{clean, CourseEnrolled, EnrollmentInfo, NewStudentRequest, StudentCreated};
use crate::error::{AppError, Result};
use crate::identity;
use crate::store::{finish, Course, NewAccount, NewStudent, Session, Store};

/// Upper bound of the `students.student_id` column.
pub const STUDENT_ID_MAX_CHARS: usize = 20;

fn student_id_for(requested: Option<&str>, ctx: &RequestContext) -> String {
    let id = match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => id.to_string(),
        None => format!("STU{}", ctx.clock.millis()),
    };
    id.chars().take(STUDENT_ID_MAX_CHARS).collect()
}

/// Inserts the enrollment row and seeds its placeholder assessment.
async fn enroll(
    session: &mut dyn Session,
    ctx: &RequestContext,
    student_id: &str,
    course_id: i64,
    reason: SeedReason,
) -> Result<SeededAssessment> {
    session
        .insert_enrollment(student_id, course_id, ctx.clock.today)
        .await?;
    seed_assessment(session, student_id, course_id, &ctx.competency, reason, &ctx.clock).await
}

async fn create_in(
    session: &mut dyn Session,
    ctx: &RequestContext,
    req: NewStudentRequest,
) -> Result<StudentCreated> {
    let first_name = clean(req.first_name.as_deref());
    let last_name = clean(req.last_name.as_deref());
    let (Some(first_name), Some(last_name)) = (first_name, last_name) else {
        return Err(AppError::validation("First name and last name are required"));
    };
    let middle_name = clean(req.middle_name.as_deref());

    let age = calculate_age(req.birth_date, ctx.clock.today).or(req.age);

    let student_id = student_id_for(req.student_id.as_deref(), ctx);
    if session.student_exists(&student_id).await? {
        return Err(AppError::conflict(format!("Student ID {student_id} already exists")));
    }

    let identity = identity::generate(
        session,
        ctx,
        (first_name.as_str(), middle_name.as_deref().unwrap_or_default(), last_name.as_str()),
        req.email.as_deref(),
    )
    .await?;
    let account_id = session
        .insert_account(&NewAccount {
            username: identity.username.clone(),
            email: identity.email.clone(),
            role_id: ctx.student_role_id,
        })
        .await?;

    session
        .insert_student(&NewStudent {
            student_id: student_id.clone(),
            account_id,
            first_name,
            middle_name,
            last_name,
            age,
            gender: clean(req.gender.as_deref()),
            birth_date: req.birth_date,
            birth_place: clean(req.birth_place.as_deref()),
            phone_number: clean(req.phone_number.as_deref()),
            address: clean(req.address.as_deref()),
            background: clean(req.background.as_deref()),
            goals: clean(req.goals.as_deref()),
            trading_level_id: req.trading_level_id,
            learning_style_id: req.learning_style_id,
            device_availability: clean(req.device_availability.as_deref()),
            rating: req.rating.unwrap_or(0.0),
            created_at: ctx.clock.now,
        })
        .await?;
    debug!(%student_id, account_id, "student row inserted");

    let mut created = StudentCreated {
        message: "Student created successfully".into(),
        student_id: student_id.clone(),
        username: identity.username,
        email: identity.email,
        account_id,
        age,
        action: "created_new".into(),
        enrollment: None,
        competency_assessment: None,
    };

    if let Some(course_id) = req.course_id {
        let course = session
            .find_course(course_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Course with ID {course_id} does not exist")))?;

        let batch_id = resolve_batch(session, course_id, &ctx.clock).await?;
        session.set_student_batch(&student_id, batch_id).await?;
        let seeded = enroll(session, ctx, &student_id, course_id, SeedReason::StudentCreated).await?;

        created.message = "Student created and enrolled successfully".into();
        created.enrollment = Some(EnrollmentInfo {
            course_id,
            batch_id,
            course_name: course.course_name,
        });
        created.competency_assessment = Some(seeded);
    }

    Ok(created)
}

/// Creates the account and student rows, optionally enrolling the student in
/// a course, as one transaction.
pub async fn create_student(
    store: &dyn Store,
    ctx: &RequestContext,
    req: NewStudentRequest,
) -> Result<StudentCreated> {
    let mut session = store.begin().await?;
    let outcome = create_in(session.as_mut(), ctx, req).await;
    let created = finish(session, outcome).await?;
    info!(
        student_id = %created.student_id,
        username = %created.username,
        enrolled = created.enrollment.is_some(),
        "student created"
    );
    Ok(created)
}

/// Enrolls an existing student in one more course.
///
/// Fails with `Validation` without a course id, `NotFound` for an unknown
/// course and `Conflict` when the student already is enrolled in it.
pub(crate) async fn add_course_in(
    session: &mut dyn Session,
    ctx: &RequestContext,
    student_id: &str,
    course_id: Option<i64>,
    reason: SeedReason,
) -> Result<(Course, SeededAssessment)> {
    let Some(course_id) = course_id else {
        return Err(AppError::validation("course_id is required"));
    };
    let course = session
        .find_course(course_id)
        .await?
        .ok_or_else(|| AppError::not_found("Course not found"))?;
    if session.is_enrolled(student_id, course_id).await? {
        return Err(AppError::conflict(format!(
            "Student is already enrolled in course: {}",
            course.course_name
        )));
    }
    let seeded = enroll(session, ctx, student_id, course_id, reason).await?;
    Ok((course, seeded))
}

async fn enroll_in(
    session: &mut dyn Session,
    ctx: &RequestContext,
    student_id: &str,
    course_id: Option<i64>,
) -> Result<CourseEnrolled> {
    if course_id.is_none() {
        return Err(AppError::validation("course_id is required"));
    }
    let student = session
        .find_student(student_id)
        .await?
        .ok_or_else(|| AppError::not_found("Student not found"))?;
    let (course, seeded) =
        add_course_in(session, ctx, student_id, course_id, SeedReason::Enrolled).await?;

    Ok(CourseEnrolled {
        message: format!(
            "Student {} {} enrolled in {} successfully",
            student.first_name, student.last_name, course.course_name
        ),
        student_id: student_id.to_string(),
        course_id: course.course_id,
        course_name: course.course_name,
        competency_assessment: seeded,
    })
}

/// `POST /students/:id/enroll`: enrollment plus seeded assessment, without
/// touching the student's batch.
pub async fn enroll_student(
    store: &dyn Store,
    ctx: &RequestContext,
    student_id: &str,
    course_id: Option<i64>,
) -> Result<CourseEnrolled> {
    let mut session = store.begin().await?;
    let outcome = enroll_in(session.as_mut(), ctx, student_id, course_id).await;
    finish(session, outcome).await
}
