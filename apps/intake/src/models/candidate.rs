use serde::{Deserialize, Serialize};

use crate::models::artifact::ArtifactRef;

/// Document formats recognised by content sniffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    Docx,
    Text,
    /// The file had no usable text; the carrying message body was parsed instead.
    Message,
}

/// Hiring track a resume most likely targets, from the intake keyword table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionCategory {
    LogicDesign,
    PhysicalDesign,
    FormalVerification,
    DesignVerification,
    Architecture,
    Internship,
    HumanResources,
    #[default]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Contact {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFields {
    pub name: Option<String>,
    pub contact: Contact,
    /// Lower-cased, sorted, unique.
    pub skills: Vec<String>,
    pub experience_years: Option<f64>,
    pub location: Option<String>,
    pub position_category: PositionCategory,
    pub raw_text: String,
}

impl StructuredFields {
    /// True when parsing produced nothing a rule could look at.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.contact.is_empty()
            && self.skills.is_empty()
            && self.experience_years.is_none()
            && self.location.is_none()
            && self.raw_text.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationStatus {
    /// Every field parser found something.
    Complete,
    /// Text was extracted but some optional fields are absent.
    Partial,
}

/// Normalized representation of one resume. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub artifact_ref: ArtifactRef,
    pub raw_bytes_digest: String,
    pub document_kind: DocumentKind,
    pub structured_fields: StructuredFields,
    pub normalization_status: NormalizationStatus,
}

/// An artifact that could not be downloaded or from which no text could be
/// extracted. Reported, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizationFailure {
    pub artifact_ref: ArtifactRef,
    /// `None` when the provider refused the download.
    pub raw_bytes_digest: Option<String>,
    pub reason: String,
}
