//! Typed shapes for the seventeen section tables.
//!
//! Domain fields are optional: a section is usually filled in piece by
//! piece as an application progresses. The foreign key is always required.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::schema::Table;

/// A section struct bound to the table it is stored in.
pub trait Section: Serialize + DeserializeOwned + Send + 'static {
    const TABLE: Table;
}

macro_rules! impl_section {
    ($($ty:ident => $table:ident),* $(,)?) => {
        $(impl Section for $ty {
            const TABLE: Table = Table::$table;
        })*
    };
}

impl_section! {
    PositionDetails => PositionDetails,
    JobRequirements => JobRequirements,
    CompanyInformation => CompanyInformation,
    SkillsMatrix => SkillsMatrix,
    SkillAssessment => SkillAssessments,
    ApplicationMaterials => ApplicationMaterials,
    InterviewSchedule => InterviewSchedule,
    InterviewPreparation => InterviewPreparation,
    CommunicationLog => CommunicationLog,
    KeyContact => KeyContacts,
    InterviewFeedback => InterviewFeedback,
    OfferDetails => OfferDetails,
    RejectionAnalysis => RejectionAnalysis,
    PrivacyPolicy => PrivacyPolicy,
    LessonsLearned => LessonsLearned,
    PerformanceMetrics => PerformanceMetrics,
    AdvisorReview => AdvisorReview,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionDetails {
    pub job_application_id: String,
    pub job_title: Option<String>,
    pub department: Option<String>,
    pub location: Option<String>,
    pub employment_type: Option<String>, // "full_time", "contract", ...
    pub work_arrangement: Option<String>, // "remote", "hybrid", "onsite"
    pub salary_range: Option<String>,
    pub reporting_to: Option<String>,
    pub posted_date: Option<String>,
    pub job_description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequirements {
    pub job_application_id: String,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub preferred_skills: Vec<String>,
    pub years_of_experience: Option<u32>,
    pub education: Option<String>,
    #[serde(default)]
    pub certifications: Vec<String>,
    #[serde(default)]
    pub responsibilities: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyInformation {
    pub job_application_id: String,
    pub company_name: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<String>,
    pub headquarters: Option<String>,
    pub website: Option<String>,
    pub mission: Option<String>,
    pub culture_notes: Option<String>,
    pub recent_news: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillsMatrix {
    pub job_application_id: String,
    pub overall_match_score: Option<f64>,
    pub summary: Option<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub gaps: Vec<String>,
}

/// One skill row under a skills matrix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkillAssessment {
    pub skills_matrix_id: String,
    pub skill_name: Option<String>,
    pub required_level: Option<String>,
    pub candidate_level: Option<String>,
    pub match_score: Option<f64>,
    pub evidence: Option<String>,
    pub is_required: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMaterials {
    pub job_application_id: String,
    pub resume_version: Option<String>,
    pub cover_letter: Option<String>,
    pub portfolio_url: Option<String>,
    pub submitted_at: Option<String>,
    pub submission_method: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterviewSchedule {
    pub job_application_id: String,
    pub round: Option<u32>,
    pub interview_type: Option<String>,
    pub scheduled_at: Option<String>,
    pub duration_minutes: Option<u32>,
    pub location: Option<String>,
    pub meeting_link: Option<String>,
    #[serde(default)]
    pub interviewers: Vec<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterviewPreparation {
    pub job_application_id: String,
    pub company_research: Option<String>,
    #[serde(default)]
    pub anticipated_questions: Vec<String>,
    #[serde(default)]
    pub questions_to_ask: Vec<String>,
    #[serde(default)]
    pub talking_points: Vec<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunicationLog {
    pub job_application_id: String,
    pub direction: Option<String>, // "inbound" or "outbound"
    pub channel: Option<String>,
    pub contact_name: Option<String>,
    pub subject: Option<String>,
    pub summary: Option<String>,
    pub occurred_at: Option<String>,
    pub follow_up_required: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyContact {
    pub job_application_id: String,
    pub name: Option<String>,
    pub role: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub linkedin_url: Option<String>,
    pub relationship: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterviewFeedback {
    pub job_application_id: String,
    pub round: Option<u32>,
    pub interviewer: Option<String>,
    pub rating: Option<u8>,
    pub strengths: Option<String>,
    pub concerns: Option<String>,
    pub outcome: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfferDetails {
    pub job_application_id: String,
    pub base_salary: Option<f64>,
    pub currency: Option<String>,
    pub bonus: Option<String>,
    pub equity: Option<String>,
    pub benefits: Option<String>,
    pub start_date: Option<String>,
    pub offer_deadline: Option<String>,
    pub negotiation_notes: Option<String>,
    pub decision: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RejectionAnalysis {
    pub job_application_id: String,
    pub stage: Option<String>,
    pub reason: Option<String>,
    pub feedback_received: Option<String>,
    #[serde(default)]
    pub improvement_areas: Vec<String>,
    pub rejected_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivacyPolicy {
    pub job_application_id: String,
    pub policy_url: Option<String>,
    pub data_retention: Option<String>,
    pub data_sharing: Option<String>,
    pub ai_screening_disclosed: Option<bool>,
    pub consent_given: Option<bool>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LessonsLearned {
    pub job_application_id: String,
    pub what_went_well: Option<String>,
    pub what_to_improve: Option<String>,
    #[serde(default)]
    pub key_takeaways: Vec<String>,
    pub apply_next_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub job_application_id: String,
    pub days_to_first_response: Option<u32>,
    pub interview_rounds: Option<u32>,
    pub hours_invested: Option<f64>,
    pub days_to_offer: Option<u32>,
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvisorReview {
    pub job_application_id: String,
    pub advisor_name: Option<String>,
    pub review_date: Option<String>,
    pub fit_score: Option<u8>,
    pub recommendation: Option<String>,
    pub comments: Option<String>,
    #[serde(default)]
    pub action_items: Vec<String>,
}
