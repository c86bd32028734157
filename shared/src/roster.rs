//! Read side of the student roster plus deletion and duplicate checks.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::dto::{
    DuplicateQuery, DuplicateReport, EnrolledCourse, StudentDeleted, StudentDetail,
    StudentFilter, StudentListing,
};
use crate::error::{AppError, Result};
use crate::store::{finish, Session, Store};

const NO_COURSES: &str = "No courses";

fn course_names(courses: &[EnrolledCourse]) -> String {
    if courses.is_empty() {
        return NO_COURSES.to_string();
    }
    courses
        .iter()
        .map(|c| c.course_name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn list_in(session: &mut dyn Session, filter: &StudentFilter) -> Result<Vec<StudentListing>> {
    let students = session.list_students(filter).await?;
    let ids: Vec<String> = students.iter().map(|s| s.student_id.clone()).collect();

    let mut by_student: HashMap<String, Vec<EnrolledCourse>> = HashMap::new();
    if !ids.is_empty() {
        for (student_id, course) in session.enrolled_courses(&ids).await? {
            by_student.entry(student_id).or_default().push(course);
        }
    }

    Ok(students
        .into_iter()
        .map(|student| {
            let mut enrolled = by_student.remove(&student.student_id).unwrap_or_default();
            enrolled.sort_by(|a, b| a.course_name.cmp(&b.course_name));
            StudentListing {
                course_names: course_names(&enrolled),
                enrolled_courses: enrolled,
                student,
            }
        })
        .collect())
}

/// Students matching the filter, newest first, each with its courses.
pub async fn list_students(store: &dyn Store, filter: &StudentFilter) -> Result<Vec<StudentListing>> {
    let mut session = store.begin().await?;
    let outcome = list_in(session.as_mut(), filter).await;
    let listing = finish(session, outcome).await?;
    debug!(count = listing.len(), "listed students");
    Ok(listing)
}

async fn detail_in(session: &mut dyn Session, student_id: &str) -> Result<StudentDetail> {
    let student = session
        .find_student(student_id)
        .await?
        .ok_or_else(|| AppError::not_found("Student not found"))?;
    let mut enrolled_courses: Vec<EnrolledCourse> = session
        .enrolled_courses(&[student.student_id.clone()])
        .await?
        .into_iter()
        .map(|(_, course)| course)
        .collect();
    enrolled_courses.sort_by(|a, b| {
        b.enrollment_date
            .cmp(&a.enrollment_date)
            .then_with(|| a.course_name.cmp(&b.course_name))
    });
    Ok(StudentDetail {
        student,
        enrolled_courses,
    })
}

pub async fn get_student(store: &dyn Store, student_id: &str) -> Result<StudentDetail> {
    let mut session = store.begin().await?;
    let outcome = detail_in(session.as_mut(), student_id).await;
    finish(session, outcome).await
}

async fn delete_in(session: &mut dyn Session, student_id: &str) -> Result<StudentDeleted> {
    let assessments = session.delete_assessments(student_id).await?;
    let enrollments = session.delete_enrollments(student_id).await?;
    let affected_rows = session.delete_student(student_id).await?;
    if affected_rows == 0 {
        return Err(AppError::not_found("Student not found"));
    }
    info!(student_id, assessments, enrollments, "student deleted");
    Ok(StudentDeleted {
        message: "Student and all related data deleted successfully".into(),
        affected_rows,
    })
}

/// Removes the student's assessments, enrollments and the student row.
/// The login account is kept.
pub async fn delete_student(store: &dyn Store, student_id: &str) -> Result<StudentDeleted> {
    let mut session = store.begin().await?;
    let outcome = delete_in(session.as_mut(), student_id).await;
    finish(session, outcome).await
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).unwrap_or_default().is_empty()
}

pub async fn find_duplicates(store: &dyn Store, query: &DuplicateQuery) -> Result<DuplicateReport> {
    if blank(&query.first_name) || blank(&query.last_name) {
        return Err(AppError::validation("first_name and last_name are required"));
    }
    let mut query = query.clone();
    if blank(&query.email) {
        query.email = None;
    }

    let mut session = store.begin().await?;
    let outcome = session.find_duplicates(&query).await;
    let potential_duplicates = finish(session, outcome).await?;
    Ok(DuplicateReport {
        count: potential_duplicates.len(),
        potential_duplicates,
    })
}
