//! `PUT /students/:id`: field updates, course changes and the add-course mode.

use tracing::info;

use crate::age::calculate_age;
use crate::batch::resolve_batch;
use crate::competency::{seed_assessment, SeedReason};
use crate::context::RequestContext;
use crate::dto::{CourseEnrolled, StudentUpdated, UpdateMode, UpdateOutcome, UpdateStudentRequest};
use crate::enrollment::add_course_in;
use crate::error::{AppError, Result};
use crate::store::{finish, Session, Store};

fn blank_name(field: &Option<Option<String>>) -> bool {
    match field {
        Some(Some(name)) => name.is_empty(),
        Some(None) => true,
        None => false,
    }
}

async fn update_in(
    session: &mut dyn Session,
    ctx: &RequestContext,
    student_id: &str,
    req: UpdateStudentRequest,
) -> Result<UpdateOutcome> {
    if !session.student_exists(student_id).await? {
        return Err(AppError::not_found("Student not found"));
    }

    if req.mode() == UpdateMode::AddCourse {
        let (course, seeded) =
            add_course_in(session, ctx, student_id, req.course_id, SeedReason::CourseAdded).await?;
        return Ok(UpdateOutcome::CourseAdded(CourseEnrolled {
            message: "Course added successfully".into(),
            student_id: student_id.to_string(),
            course_id: course.course_id,
            course_name: course.course_name,
            competency_assessment: seeded,
        }));
    }

    let mut patch = req.patch;
    patch.trim();
    if blank_name(&patch.first_name) || blank_name(&patch.last_name) {
        return Err(AppError::validation("First name and last name cannot be empty"));
    }
    match patch.birth_date {
        Some(Some(birth_date)) => {
            patch.age = Some(calculate_age(Some(birth_date), ctx.clock.today));
        }
        // Clearing the birth date leaves a manual age as the only source.
        Some(None) => {
            if patch.age.is_none() {
                patch.age = Some(None);
            }
        }
        None if patch.age.is_some() => {
            let stored = session.find_student(student_id).await?;
            if let Some(birth_date) = stored.and_then(|s| s.birth_date) {
                patch.age = Some(calculate_age(Some(birth_date), ctx.clock.today));
            }
        }
        None => {}
    }
    let updated_age = patch.age.flatten();

    let mut new_assessment = None;
    if let Some(course_id) = req.course_id {
        let current = session.current_course(student_id).await?;
        if current != Some(course_id) {
            let course = session
                .find_course(course_id)
                .await?
                .ok_or_else(|| AppError::not_found("Course not found"))?;
            if !session.is_enrolled(student_id, course_id).await? {
                session
                    .insert_enrollment(student_id, course_id, ctx.clock.today)
                    .await?;
            }
            let mut seeded = seed_assessment(
                session,
                student_id,
                course_id,
                &ctx.competency,
                SeedReason::CourseChanged,
                &ctx.clock,
            )
            .await?;
            seeded.course_name = Some(course.course_name);

            let batch_id = resolve_batch(session, course_id, &ctx.clock).await?;
            patch.batch_id = Some(Some(batch_id));
            info!(student_id, from = ?current, to = course_id, batch_id, "course changed");
            new_assessment = Some(seeded);
        }
    }

    if patch.is_empty() && new_assessment.is_none() {
        return Err(AppError::validation("No valid fields to update"));
    }
    if !patch.is_empty() {
        session.update_student(student_id, &patch, ctx.clock.now).await?;
    }

    let message = if new_assessment.is_some() {
        "Student updated and new competency assessment created"
    } else {
        "Student updated successfully"
    };
    Ok(UpdateOutcome::Updated(StudentUpdated {
        message: message.into(),
        student_id: student_id.to_string(),
        updated_age,
        new_competency_assessment: new_assessment,
    }))
}

/// Applies an update request to a student inside one transaction.
///
/// A `course_id` different from the student's current course enrolls the
/// student (if needed), seeds a new assessment attempt and moves the student
/// to the course's active batch.
pub async fn update_student(
    store: &dyn Store,
    ctx: &RequestContext,
    student_id: &str,
    req: UpdateStudentRequest,
) -> Result<UpdateOutcome> {
    let mut session = store.begin().await?;
    let outcome = update_in(session.as_mut(), ctx, student_id, req).await;
    finish(session, outcome).await
}
