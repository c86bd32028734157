use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use strum_macros::{Display, EnumString};

use crate::competency::SeededAssessment;

/* ---------------- serde helpers ---------------- */

fn parse_date(raw: &str) -> Result<NaiveDate, chrono::ParseError> {
    // Browsers may send a full ISO timestamp; only the calendar date counts.
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
}

/// Reads an optional date, treating `null` and blank strings as absent.
pub fn blank_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => parse_date(s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Marks a patch field as present. Combined with `#[serde(default)]` an absent
/// key stays `None` while an explicit `null` becomes `Some(None)`.
pub fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

pub fn present_date<'de, D>(deserializer: D) -> Result<Option<Option<NaiveDate>>, D::Error>
where
    D: Deserializer<'de>,
{
    blank_date(deserializer).map(Some)
}

/// Form inputs arrive as text, API clients send numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText<T> {
    Number(T),
    Text(String),
}

/// `None` for `null`, `Some(None)` for a blank string.
fn number_or_text<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    match Option::<NumberOrText<T>>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(n)) => Ok(Some(Some(n))),
        Some(NumberOrText::Text(raw)) => match raw.trim() {
            "" => Ok(Some(None)),
            s => s
                .parse()
                .map(|n| Some(Some(n)))
                .map_err(|e| serde::de::Error::custom(format!("invalid number {raw:?}: {e}"))),
        },
    }
}

/// Reads an optional number given either as a JSON number or as numeric text.
/// `null` and blank strings are absent.
pub fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    number_or_text(deserializer).map(Option::flatten)
}

/// Patch flavour of [`lenient`]: `null` clears the column, a blank string
/// leaves it untouched.
pub fn lenient_present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    Ok(match number_or_text(deserializer)? {
        None => Some(None),
        Some(None) => None,
        Some(Some(n)) => Some(Some(n)),
    })
}

/// Trims a free-text value; blank input is stored as NULL.
pub fn clean(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/* ---------------- shared enums ---------------- */

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExamStatus {
    Failed,
    Completed,
}

impl ExamStatus {
    pub fn for_score(score: f64, passing_score: f64) -> Self {
        if score >= passing_score {
            ExamStatus::Completed
        } else {
            ExamStatus::Failed
        }
    }
}

/* ---------------- students ---------------- */

/// Payload of `POST /students`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct NewStudentRequest {
    pub student_id: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    /// Only used when no birth date is given.
    #[serde(default, deserialize_with = "lenient")]
    pub age: Option<i32>,
    pub gender: Option<String>,
    #[serde(default, deserialize_with = "blank_date")]
    pub birth_date: Option<NaiveDate>,
    pub birth_place: Option<String>,
    pub phone_number: Option<String>,
    pub address: Option<String>,
    pub background: Option<String>,
    pub goals: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub course_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub trading_level_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub learning_style_id: Option<i64>,
    pub device_availability: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnrollmentInfo {
    pub course_id: i64,
    pub batch_id: i64,
    pub course_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentCreated {
    pub message: String,
    pub student_id: String,
    pub username: String,
    pub email: String,
    pub account_id: i64,
    pub age: Option<i32>,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment: Option<EnrollmentInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub competency_assessment: Option<SeededAssessment>,
}

/// Allow-listed student columns an update may touch.
///
/// Every field distinguishes "not sent" (`None`) from "set to NULL"
/// (`Some(None)`).
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct StudentPatch {
    #[serde(default, deserialize_with = "present")]
    pub first_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub middle_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub last_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "lenient_present")]
    pub age: Option<Option<i32>>,
    #[serde(default, deserialize_with = "present")]
    pub gender: Option<Option<String>>,
    #[serde(default, deserialize_with = "present_date")]
    pub birth_date: Option<Option<NaiveDate>>,
    #[serde(default, deserialize_with = "present")]
    pub birth_place: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub phone_number: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub address: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub background: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub goals: Option<Option<String>>,
    #[serde(default, deserialize_with = "lenient_present")]
    pub batch_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "lenient_present")]
    pub trading_level_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "lenient_present")]
    pub learning_style_id: Option<Option<i64>>,
    #[serde(default, deserialize_with = "present")]
    pub device_availability: Option<Option<String>>,
    #[serde(default, deserialize_with = "lenient_present")]
    pub rating: Option<Option<f64>>,
    #[serde(default, deserialize_with = "present")]
    pub is_graduated: Option<Option<bool>>,
    #[serde(default, deserialize_with = "present")]
    pub eligibility_status: Option<Option<String>>,
    #[serde(default, deserialize_with = "present_date")]
    pub graduation_date: Option<Option<NaiveDate>>,
}

fn trim_field(field: &mut Option<Option<String>>) {
    if let Some(Some(value)) = field {
        *value = value.trim().to_string();
    }
}

impl StudentPatch {
    pub fn is_empty(&self) -> bool {
        *self == StudentPatch::default()
    }

    /// Trims every text value in place.
    pub fn trim(&mut self) {
        for field in [
            &mut self.first_name,
            &mut self.middle_name,
            &mut self.last_name,
            &mut self.gender,
            &mut self.birth_place,
            &mut self.phone_number,
            &mut self.address,
            &mut self.background,
            &mut self.goals,
            &mut self.device_availability,
            &mut self.eligibility_status,
        ] {
            trim_field(field);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Update,
    AddCourse,
}

/// Payload of `PUT /students/:id`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct UpdateStudentRequest {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub course_id: Option<i64>,
    #[serde(flatten)]
    pub patch: StudentPatch,
}

impl UpdateStudentRequest {
    pub fn mode(&self) -> UpdateMode {
        match self.mode.as_deref() {
            Some("addCourse") => UpdateMode::AddCourse,
            _ => UpdateMode::Update,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentUpdated {
    pub message: String,
    pub student_id: String,
    pub updated_age: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_competency_assessment: Option<SeededAssessment>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct EnrollRequest {
    #[serde(default, deserialize_with = "lenient")]
    pub course_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseEnrolled {
    pub message: String,
    pub student_id: String,
    pub course_id: i64,
    pub course_name: String,
    pub competency_assessment: SeededAssessment,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum UpdateOutcome {
    Updated(StudentUpdated),
    CourseAdded(CourseEnrolled),
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentDeleted {
    pub message: String,
    #[serde(rename = "affectedRows")]
    pub affected_rows: u64,
}

/// Row of the `students` table.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StudentRecord {
    pub student_id: String,
    pub account_id: i64,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub age: Option<i32>,
    pub gender: Option<String>,
    pub batch_id: Option<i64>,
    pub birth_date: Option<NaiveDate>,
    pub birth_place: Option<String>,
    pub phone_number: Option<String>,
    pub address: Option<String>,
    pub background: Option<String>,
    pub goals: Option<String>,
    pub trading_level_id: Option<i64>,
    pub learning_style_id: Option<i64>,
    pub device_availability: Option<String>,
    pub rating: Option<f64>,
    pub is_graduated: bool,
    pub eligibility_status: Option<String>,
    pub graduation_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct EnrolledCourse {
    pub course_id: i64,
    pub course_name: String,
    pub enrollment_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentListing {
    #[serde(flatten)]
    pub student: StudentRecord,
    pub enrolled_courses: Vec<EnrolledCourse>,
    pub course_names: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentDetail {
    #[serde(flatten)]
    pub student: StudentRecord,
    pub enrolled_courses: Vec<EnrolledCourse>,
}

/// Query of `GET /students`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StudentFilter {
    pub q: Option<String>,
    pub batch_id: Option<i64>,
}

/// Query of `GET /students/check-duplicates`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct DuplicateQuery {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default, deserialize_with = "blank_date")]
    pub birth_date: Option<NaiveDate>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct DuplicateCandidate {
    pub student_id: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub birth_date: Option<NaiveDate>,
    pub email: String,
    /// Comma separated course names, `None` without enrollments.
    pub enrolled_courses: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateReport {
    pub potential_duplicates: Vec<DuplicateCandidate>,
    pub count: usize,
}

/* ---------------- competency ---------------- */

/// Payload of `POST /students/competency-assessments`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct NewAssessmentRequest {
    pub student_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub course_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub competency_type_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub score: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedAssessment {
    pub student_id: String,
    pub course_id: i64,
    pub competency_type: String,
    pub attempt_number: i32,
    pub score: f64,
    pub passing_score: f64,
    pub status: ExamStatus,
    pub is_passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssessmentRecorded {
    pub message: String,
    pub assessment: RecordedAssessment,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompetencySummary {
    pub competency_type_id: i64,
    pub competency_type: String,
    pub passing_score: f64,
    pub attempts: i32,
    pub best_score: f64,
    pub latest_status: ExamStatus,
    pub is_passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompetencyProgress {
    pub student_id: String,
    pub course_id: i64,
    pub competencies: Vec<CompetencySummary>,
    /// Share of competency types passed, in percent.
    pub completion_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_tells_null_from_absent() {
        let req: UpdateStudentRequest = serde_json::from_value(json!({
            "middle_name": null,
            "goals": "  trade  ",
            "rating": 4,
        }))
        .unwrap();
        assert_eq!(req.mode(), UpdateMode::Update);
        assert_eq!(req.patch.middle_name, Some(None));
        assert_eq!(req.patch.first_name, None);
        assert_eq!(req.patch.rating, Some(Some(4.0)));

        let mut patch = req.patch;
        patch.trim();
        assert_eq!(patch.goals, Some(Some("trade".into())));
        assert!(!patch.is_empty());
    }

    #[test]
    fn add_course_mode_and_course_id_are_not_patch_fields() {
        let req: UpdateStudentRequest =
            serde_json::from_value(json!({ "mode": "addCourse", "course_id": 3 })).unwrap();
        assert_eq!(req.mode(), UpdateMode::AddCourse);
        assert_eq!(req.course_id, Some(3));
        assert!(req.patch.is_empty());
    }

    #[test]
    fn blank_birth_date_is_absent() {
        let req: NewStudentRequest =
            serde_json::from_value(json!({ "first_name": "A", "birth_date": "" })).unwrap();
        assert_eq!(req.birth_date, None);

        let req: NewStudentRequest = serde_json::from_value(
            json!({ "first_name": "A", "birth_date": "2000-03-15T00:00:00.000Z" }),
        )
        .unwrap();
        assert_eq!(req.birth_date, NaiveDate::from_ymd_opt(2000, 3, 15));
    }

    #[test]
    fn form_numbers_arrive_as_text() {
        let req: NewStudentRequest = serde_json::from_value(json!({
            "first_name": "Maria",
            "last_name": "Santos",
            "course_id": "7",
            "batch_id": "",
            "age": "",
            "rating": " 4.5 ",
            "trading_level_id": 2,
        }))
        .unwrap();
        assert_eq!(req.course_id, Some(7));
        assert_eq!(req.age, None);
        assert_eq!(req.rating, Some(4.5));
        assert_eq!(req.trading_level_id, Some(2));
        assert_eq!(req.learning_style_id, None);

        let req: EnrollRequest = serde_json::from_value(json!({ "course_id": "8" })).unwrap();
        assert_eq!(req.course_id, Some(8));

        let err = serde_json::from_value::<EnrollRequest>(json!({ "course_id": "seven" }))
            .unwrap_err();
        assert!(err.to_string().contains("invalid number"), "{err}");
    }

    #[test]
    fn blank_patch_numbers_are_untouched_and_null_clears() {
        let req: UpdateStudentRequest = serde_json::from_value(json!({
            "mode": "update",
            "course_id": "",
            "batch_id": "",
            "age": "31",
            "rating": null,
            "learning_style_id": "3",
        }))
        .unwrap();
        assert_eq!(req.course_id, None);
        assert_eq!(req.patch.batch_id, None);
        assert_eq!(req.patch.age, Some(Some(31)));
        assert_eq!(req.patch.rating, Some(None));
        assert_eq!(req.patch.learning_style_id, Some(Some(3)));
        assert_eq!(req.patch.trading_level_id, None);
    }

    #[test]
    fn patch_birth_date_null_clears() {
        let req: UpdateStudentRequest =
            serde_json::from_value(json!({ "birth_date": null })).unwrap();
        assert_eq!(req.patch.birth_date, Some(None));
    }

    #[test]
    fn exam_status_threshold() {
        assert_eq!(ExamStatus::for_score(75.0, 75.0), ExamStatus::Completed);
        assert_eq!(ExamStatus::for_score(74.99, 75.0), ExamStatus::Failed);
        assert_eq!(ExamStatus::Failed.to_string(), "failed");
        assert_eq!("completed".parse::<ExamStatus>().unwrap(), ExamStatus::Completed);
    }

    #[test]
    fn clean_drops_blank_text() {
        assert_eq!(clean(Some("  ")), None);
        assert_eq!(clean(Some(" Manila ")), Some("Manila".into()));
        assert_eq!(clean(None), None);
    }
}
