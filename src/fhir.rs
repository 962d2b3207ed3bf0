//! FHIR R4 resource model
//!
//! Read-side representation of the four resource types the analytics core
//! consumes: Patient, Observation, Condition and Encounter.
//!
//! Upstream servers routinely omit fields, so every element except `id` is
//! optional. Derivations pattern-match on presence instead of assuming shape.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Resource types fetched from the upstream server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Patient,
    Observation,
    Condition,
    Encounter,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Patient => "Patient",
            ResourceType::Observation => "Observation",
            ResourceType::Condition => "Condition",
            ResourceType::Encounter => "Encounter",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource that can be decoded from a Bundle entry
pub trait FhirResource: serde::de::DeserializeOwned {
    const RESOURCE_TYPE: ResourceType;
}

/// Typed link to another resource, parsed once at ingestion.
///
/// `"Patient/123"` becomes `Reference { kind: "Patient", id: "123" }`.
/// Strings without a `/` are kept with an empty kind so they never match a
/// patient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    kind: String,
    id: String,
}

impl Reference {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn patient(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Patient.as_str(), id)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_patient(&self) -> bool {
        self.kind == ResourceType::Patient.as_str()
    }
}

impl FromStr for Reference {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.split_once('/') {
            Some((kind, id)) => Reference::new(kind, id),
            None => Reference::new("", s),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_empty() {
            f.write_str(&self.id)
        } else {
            write!(f, "{}/{}", self.kind, self.id)
        }
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// FHIR reference element (`{"reference": "Patient/1", "display": ...}`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FhirReference {
    #[serde(default, deserialize_with = "deserialize_reference")]
    pub reference: Option<Reference>,
    #[serde(default)]
    pub display: Option<String>,
}

fn deserialize_reference<'de, D>(deserializer: D) -> Result<Option<Reference>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| s.parse().ok()))
}

/// FHIR coding element
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FhirCoding {
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub display: Option<String>,
}

/// FHIR codeable concept
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FhirCodeableConcept {
    #[serde(default)]
    pub coding: Vec<FhirCoding>,
    #[serde(default)]
    pub text: Option<String>,
}

impl FhirCodeableConcept {
    /// Free text first, then the first coding's display.
    pub fn display_name(&self) -> Option<&str> {
        non_empty(self.text.as_deref())
            .or_else(|| self.coding.first().and_then(|c| non_empty(c.display.as_deref())))
    }

    /// Code of the first coding, if any.
    pub fn first_code(&self) -> Option<&str> {
        self.coding.first().and_then(|c| c.code.as_deref())
    }
}

/// FHIR quantity value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FhirQuantity {
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

/// FHIR period
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FhirPeriod {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

/// FHIR human name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HumanName {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub given: Vec<String>,
}

/// FHIR address (only the parts the dashboard shows)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// Administrative gender
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Gender {
    Male,
    Female,
    Other,
    Unknown,
    /// Anything outside the FHIR value set, kept verbatim
    Unrecognized(String),
}

impl Gender {
    pub fn as_str(&self) -> &str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
            Gender::Other => "other",
            Gender::Unknown => "unknown",
            Gender::Unrecognized(value) => value,
        }
    }
}

impl From<String> for Gender {
    fn from(value: String) -> Self {
        match value.as_str() {
            "male" => Gender::Male,
            "female" => Gender::Female,
            "other" => Gender::Other,
            "unknown" => Gender::Unknown,
            _ => Gender::Unrecognized(value),
        }
    }
}

impl<'de> Deserialize<'de> for Gender {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Gender::from)
    }
}

impl Serialize for Gender {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// FHIR R4 Patient resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: String,
    #[serde(default)]
    pub name: Vec<HumanName>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub birth_date: Option<String>,
    #[serde(default)]
    pub address: Vec<Address>,
}

impl Patient {
    /// Display name: free text, else given names followed by family name.
    pub fn display_name(&self) -> Option<String> {
        let name = self.name.first()?;
        if let Some(text) = non_empty(name.text.as_deref()) {
            return Some(text.to_string());
        }

        let parts: Vec<&str> = name
            .given
            .iter()
            .map(String::as_str)
            .chain(name.family.as_deref())
            .filter(|p| !p.trim().is_empty())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

impl FhirResource for Patient {
    const RESOURCE_TYPE: ResourceType = ResourceType::Patient;
}

/// Sub-measurement of an observation (e.g. systolic/diastolic)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationComponent {
    #[serde(default)]
    pub code: FhirCodeableConcept,
    #[serde(default)]
    pub value_quantity: Option<FhirQuantity>,
}

/// FHIR R4 Observation resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub code: FhirCodeableConcept,
    #[serde(default)]
    pub subject: Option<FhirReference>,
    #[serde(default)]
    pub effective_date_time: Option<String>,
    #[serde(default)]
    pub value_quantity: Option<FhirQuantity>,
    #[serde(default)]
    pub component: Vec<ObservationComponent>,
}

impl FhirResource for Observation {
    const RESOURCE_TYPE: ResourceType = ResourceType::Observation;
}

/// FHIR R4 Condition resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub id: String,
    #[serde(default)]
    pub clinical_status: Option<FhirCodeableConcept>,
    #[serde(default)]
    pub code: Option<FhirCodeableConcept>,
    #[serde(default)]
    pub subject: Option<FhirReference>,
    #[serde(default)]
    pub recorded_date: Option<String>,
}

impl Condition {
    pub fn display_name(&self) -> Option<&str> {
        self.code.as_ref().and_then(FhirCodeableConcept::display_name)
    }

    pub fn clinical_status_code(&self) -> Option<&str> {
        self.clinical_status
            .as_ref()
            .and_then(FhirCodeableConcept::first_code)
    }
}

impl FhirResource for Condition {
    const RESOURCE_TYPE: ResourceType = ResourceType::Condition;
}

/// FHIR R4 Encounter resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Encounter {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub class: Option<FhirCoding>,
    #[serde(default, rename = "type")]
    pub encounter_type: Vec<FhirCodeableConcept>,
    #[serde(default)]
    pub subject: Option<FhirReference>,
    #[serde(default)]
    pub period: Option<FhirPeriod>,
}

impl Encounter {
    pub fn period_start(&self) -> Option<&str> {
        self.period.as_ref().and_then(|p| non_empty(p.start.as_deref()))
    }

    /// Label used on the timeline: type text, else class display.
    pub fn label(&self) -> String {
        self.encounter_type
            .first()
            .and_then(|t| non_empty(t.text.as_deref()))
            .or_else(|| self.class.as_ref().and_then(|c| non_empty(c.display.as_deref())))
            .unwrap_or("Encounter")
            .to_string()
    }
}

impl FhirResource for Encounter {
    const RESOURCE_TYPE: ResourceType = ResourceType::Encounter;
}

/// Resources linked to a patient through `subject`
pub trait HasSubject {
    fn subject_reference(&self) -> Option<&Reference>;
}

macro_rules! impl_has_subject {
    ($($ty:ty),*) => {
        $(impl HasSubject for $ty {
            fn subject_reference(&self) -> Option<&Reference> {
                self.subject.as_ref().and_then(|s| s.reference.as_ref())
            }
        })*
    };
}

impl_has_subject!(Observation, Condition, Encounter);

/// FHIR Bundle envelope as returned by search interactions.
///
/// Entries are kept as raw JSON so one malformed resource does not fail the
/// whole page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FhirBundle {
    #[serde(default)]
    pub entry: Vec<FhirBundleEntry>,
}

/// FHIR Bundle entry
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FhirBundleEntry {
    #[serde(default)]
    pub resource: Option<serde_json::Value>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reference_parsing() {
        let reference: Reference = "Patient/123".parse().unwrap();
        assert!(reference.is_patient());
        assert_eq!(reference.id(), "123");
        assert_eq!(reference.to_string(), "Patient/123");

        let group: Reference = "Group/9".parse().unwrap();
        assert!(!group.is_patient());

        let bare: Reference = "123".parse().unwrap();
        assert!(!bare.is_patient());
        assert_eq!(bare.to_string(), "123");
    }

    #[test]
    fn test_patient_with_missing_fields() {
        let patient: Patient = serde_json::from_value(json!({
            "resourceType": "Patient",
            "id": "p1"
        }))
        .unwrap();

        assert!(patient.gender.is_none());
        assert!(patient.birth_date.is_none());
        assert!(patient.display_name().is_none());
    }

    #[test]
    fn test_patient_display_name() {
        let patient: Patient = serde_json::from_value(json!({
            "id": "p1",
            "name": [{ "family": "Chalmers", "given": ["Peter", "James"] }],
            "gender": "male"
        }))
        .unwrap();

        assert_eq!(patient.display_name().as_deref(), Some("Peter James Chalmers"));
        assert_eq!(patient.gender, Some(Gender::Male));
    }

    #[test]
    fn test_unrecognized_gender_kept() {
        let patient: Patient =
            serde_json::from_value(json!({ "id": "p1", "gender": "nonbinary" })).unwrap();
        assert_eq!(patient.gender.unwrap().as_str(), "nonbinary");
    }

    #[test]
    fn test_condition_name_prefers_text() {
        let condition: Condition = serde_json::from_value(json!({
            "id": "c1",
            "code": { "text": "High blood pressure", "coding": [{ "display": "Hypertension" }] },
            "clinicalStatus": { "coding": [{ "code": "active" }] },
            "subject": { "reference": "Patient/1" }
        }))
        .unwrap();

        assert_eq!(condition.display_name(), Some("High blood pressure"));
        assert_eq!(condition.clinical_status_code(), Some("active"));
        assert_eq!(
            condition.subject_reference(),
            Some(&Reference::patient("1"))
        );
    }

    #[test]
    fn test_blank_subject_reference_is_absent() {
        let encounter: Encounter = serde_json::from_value(json!({
            "id": "e1",
            "subject": { "reference": "  " }
        }))
        .unwrap();

        assert!(encounter.subject_reference().is_none());
        assert_eq!(encounter.label(), "Encounter");
    }

    #[test]
    fn test_bundle_entry_without_resource() {
        let bundle: FhirBundle = serde_json::from_value(json!({
            "resourceType": "Bundle",
            "entry": [{ "fullUrl": "urn:1" }, { "resource": { "id": "x" } }]
        }))
        .unwrap();

        assert_eq!(bundle.entry.len(), 2);
        assert!(bundle.entry[0].resource.is_none());
    }
}
