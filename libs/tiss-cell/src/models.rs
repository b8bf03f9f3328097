// libs/tiss-cell/src/models.rs
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Money is always kept with two decimal places, rounding half away from zero.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Rounded money rendered with exactly two decimals: `1234.5` -> `1234.50`.
pub fn format_money(value: Decimal) -> String {
    let mut rounded = round_money(value);
    rounded.rescale(2);
    rounded.to_string()
}

// ==============================================================================
// ENUMS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GuideType {
    #[serde(alias = "consulta")]
    Consultation,
    #[serde(alias = "exam", alias = "sp_sadt")]
    Sadt,
    #[serde(alias = "internacao")]
    Hospitalization,
}

impl fmt::Display for GuideType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuideType::Consultation => write!(f, "consultation"),
            GuideType::Sadt => write!(f, "sadt"),
            GuideType::Hospitalization => write!(f, "hospitalization"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GuideStatus {
    Pending,
    Approved,
    Denied,
    Partial,
}

impl fmt::Display for GuideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuideStatus::Pending => write!(f, "pending"),
            GuideStatus::Approved => write!(f, "approved"),
            GuideStatus::Denied => write!(f, "denied"),
            GuideStatus::Partial => write!(f, "partial"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Draft,
    Valid,
    Invalid,
    Submitted,
    Approved,
    Denied,
    Partial,
}

impl BatchStatus {
    pub fn valid_transitions(&self) -> Vec<BatchStatus> {
        match self {
            BatchStatus::Draft => vec![BatchStatus::Valid, BatchStatus::Invalid],
            // Regenerating the XML keeps the batch VALID
            BatchStatus::Valid => vec![
                BatchStatus::Valid,
                BatchStatus::Submitted,
                BatchStatus::Invalid,
                BatchStatus::Approved,
                BatchStatus::Denied,
                BatchStatus::Partial,
            ],
            BatchStatus::Submitted => vec![
                BatchStatus::Approved,
                BatchStatus::Denied,
                BatchStatus::Partial,
            ],
            BatchStatus::Invalid
            | BatchStatus::Approved
            | BatchStatus::Denied
            | BatchStatus::Partial => vec![],
        }
    }

    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// Batch outcome from the multiset of guide outcomes.
    pub fn from_outcomes(counts: &OutcomeCounts) -> BatchStatus {
        let total = counts.total();
        if total > 0 && counts.approved == total {
            BatchStatus::Approved
        } else if total > 0 && counts.denied == total {
            BatchStatus::Denied
        } else {
            BatchStatus::Partial
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Draft => write!(f, "draft"),
            BatchStatus::Valid => write!(f, "valid"),
            BatchStatus::Invalid => write!(f, "invalid"),
            BatchStatus::Submitted => write!(f, "submitted"),
            BatchStatus::Approved => write!(f, "approved"),
            BatchStatus::Denied => write!(f, "denied"),
            BatchStatus::Partial => write!(f, "partial"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReturnProcessingStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl ReturnProcessingStatus {
    /// A return can be (re)processed from PENDING or after a failed attempt.
    pub fn can_start_processing(&self) -> bool {
        matches!(self, ReturnProcessingStatus::Pending | ReturnProcessingStatus::Error)
    }
}

impl fmt::Display for ReturnProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnProcessingStatus::Pending => write!(f, "pending"),
            ReturnProcessingStatus::Processing => write!(f, "processing"),
            ReturnProcessingStatus::Completed => write!(f, "completed"),
            ReturnProcessingStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlosaType {
    Total,
    Partial,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlosaCategory {
    Authorization,
    Pricing,
    Documentation,
    Eligibility,
    Coding,
    Other,
}

impl GlosaCategory {
    pub fn parse(raw: &str) -> Option<GlosaCategory> {
        match raw.trim().to_lowercase().as_str() {
            "authorization" | "autorizacao" | "autorização" => Some(GlosaCategory::Authorization),
            "pricing" | "valor" | "valores" | "preco" | "preço" => Some(GlosaCategory::Pricing),
            "documentation" | "documentacao" | "documentação" => Some(GlosaCategory::Documentation),
            "eligibility" | "elegibilidade" => Some(GlosaCategory::Eligibility),
            "coding" | "codificacao" | "codificação" => Some(GlosaCategory::Coding),
            "other" | "outros" | "outro" => Some(GlosaCategory::Other),
            _ => None,
        }
    }

    /// Best-effort classification from the insurer's free-text reason.
    pub fn infer(description: Option<&str>) -> GlosaCategory {
        let Some(text) = description.map(str::to_lowercase) else {
            return GlosaCategory::Other;
        };

        let has = |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));

        if has(&["autoriza", "senha"]) {
            GlosaCategory::Authorization
        } else if has(&["elegib", "carteira", "beneficiári", "beneficiari", "carência", "carencia"]) {
            GlosaCategory::Eligibility
        } else if has(&["valor", "preço", "preco", "tabela", "cobrança", "cobranca"]) {
            GlosaCategory::Pricing
        } else if has(&["document", "assinatura", "laudo", "prontuário", "prontuario"]) {
            GlosaCategory::Documentation
        } else if has(&["cid", "código", "codigo", "tuss"]) {
            GlosaCategory::Coding
        } else {
            GlosaCategory::Other
        }
    }

    /// Eligibility denials cannot be fixed by an appeal; everything else can.
    pub fn appealable_by_default(&self) -> bool {
        !matches!(self, GlosaCategory::Eligibility)
    }
}

// ==============================================================================
// CORE TISS RECORDS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Procedure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guide_id: Option<Uuid>,
    pub procedure_code: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    #[serde(default = "default_reduction_factor")]
    pub reduction_factor: Decimal,
    pub total_price: Decimal,
}

fn default_reduction_factor() -> Decimal {
    Decimal::ONE
}

impl Procedure {
    pub fn compute_total(quantity: Decimal, unit_price: Decimal, reduction_factor: Decimal) -> Decimal {
        round_money(quantity * unit_price * reduction_factor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeneficiaryPatient {
    pub full_name: Option<String>,
    pub cpf: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeneficiaryCard {
    pub card_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TissGuide {
    pub id: Uuid,
    pub guide_number: String,
    pub guide_type: GuideType,
    pub clinic_id: Uuid,
    pub operator_id: Uuid,
    pub patient_id: Uuid,
    pub patient_insurance_id: Uuid,
    pub doctor_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
    pub cid_primary: Option<String>,
    pub cid_secondary: Option<Vec<String>>,
    pub authorization_number: Option<String>,
    pub execution_date: NaiveDate,
    pub total_value: Option<Decimal>,
    pub status: GuideStatus,
    pub glosa_value: Option<Decimal>,
    pub observation: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Embedded relations (PostgREST resource embedding)
    #[serde(default)]
    pub procedures: Vec<Procedure>,
    #[serde(default)]
    pub patient: Option<BeneficiaryPatient>,
    #[serde(default)]
    pub patient_insurance: Option<BeneficiaryCard>,
}

impl TissGuide {
    pub fn procedures_total(&self) -> Decimal {
        round_money(self.procedures.iter().map(|p| p.total_price).sum())
    }

    /// The amount billed for this guide: the aggregated total once set, the
    /// procedure sum before batching.
    pub fn billed_value(&self) -> Decimal {
        self.total_value.unwrap_or_else(|| self.procedures_total())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TissBatch {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub insurance_company_id: Uuid,
    pub batch_number: String,
    pub reference_month: u32,
    pub reference_year: i32,
    pub total_guides: i64,
    pub total_value: Decimal,
    pub status: BatchStatus,
    pub xml_file_url: Option<String>,
    pub xml_file_size: Option<i64>,
    pub xml_generated_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Glosa {
    pub id: Uuid,
    pub guide_id: Uuid,
    pub batch_id: Uuid,
    pub return_id: Uuid,
    pub glosa_type: GlosaType,
    pub glosa_code: Option<String>,
    pub glosa_description: Option<String>,
    pub category: GlosaCategory,
    pub glosa_value: Decimal,
    pub original_value: Decimal,
    pub approved_value: Decimal,
    pub can_appeal: bool,
    pub appeal_status: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TissReturn {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub batch_id: Uuid,
    pub file_name: String,
    pub file_url: Option<String>,
    pub raw_content: Option<String>,
    pub processing_status: ReturnProcessingStatus,
    pub processing_error: Option<String>,
    pub total_guides_processed: Option<i64>,
    pub total_approved: Option<i64>,
    pub total_denied: Option<i64>,
    pub total_partial: Option<i64>,
    pub amount_requested: Option<Decimal>,
    pub amount_approved: Option<Decimal>,
    pub amount_denied: Option<Decimal>,
    pub parsed_data: Option<Value>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ==============================================================================
// COLLABORATOR RECORDS (owned by other cells, read-only here)
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clinic {
    pub id: Uuid,
    pub name: String,
    pub cnpj: Option<String>,
    pub cnes: Option<String>,
    pub email: Option<String>,
    pub subscription_plan: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsuranceOperator {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub name: String,
    pub ans_code: Option<String>,
    /// Code the insurer assigned to the clinic as a contracted provider.
    pub provider_code: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientInsurance {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub insurance_company_id: Uuid,
    pub card_number: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillableAppointment {
    pub id: Uuid,
    pub clinic_id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Option<Uuid>,
    pub patient_insurance_id: Option<Uuid>,
    pub insurance_company_id: Uuid,
    pub appointment_date: DateTime<Utc>,
    pub payment_amount: Option<Decimal>,
    pub cid_primary: Option<String>,
}

// ==============================================================================
// REQUESTS
// ==============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureInput {
    pub procedure_code: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub reduction_factor: Option<Decimal>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateGuideRequest {
    pub guide_type: Option<GuideType>,
    pub patient_id: Option<Uuid>,
    pub patient_insurance_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub appointment_id: Option<Uuid>,
    pub cid_primary: Option<String>,
    pub cid_secondary: Option<Vec<String>>,
    pub authorization_number: Option<String>,
    pub execution_date: Option<NaiveDate>,
    pub observation: Option<String>,
    #[serde(default)]
    pub procedures: Vec<ProcedureInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuideListQuery {
    pub status: Option<GuideStatus>,
    pub operator_id: Option<Uuid>,
    pub patient_id: Option<Uuid>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBatchRequest {
    pub operator_id: Uuid,
    pub reference_month: u32,
    pub reference_year: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunMonthlyBatchingRequest {
    /// Any date inside the month after the one to bill; defaults to today.
    pub reference_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReturnRequest {
    pub batch_id: Uuid,
    pub file_name: String,
    pub content: Option<String>,
    pub file_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlosaListQuery {
    pub batch_id: Option<Uuid>,
    pub guide_id: Option<Uuid>,
}

// ==============================================================================
// RESULTS
// ==============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct GuidePage {
    pub guides: Vec<TissGuide>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct XmlGenerationResult {
    pub xml_url: String,
    pub file_size: usize,
    pub guide_count: usize,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub approved: usize,
    pub denied: usize,
    pub partial: usize,
}

impl OutcomeCounts {
    pub fn total(&self) -> usize {
        self.approved + self.denied + self.partial
    }

    pub fn record(&mut self, status: GuideStatus) {
        match status {
            GuideStatus::Approved => self.approved += 1,
            GuideStatus::Denied => self.denied += 1,
            GuideStatus::Partial => self.partial += 1,
            GuideStatus::Pending => {}
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReturnProcessingSummary {
    pub return_id: Uuid,
    pub batch_id: Uuid,
    pub batch_status: BatchStatus,
    pub total_guides_processed: usize,
    pub total_approved: usize,
    pub total_denied: usize,
    pub total_partial: usize,
    pub amount_requested: Decimal,
    pub amount_approved: Decimal,
    pub amount_denied: Decimal,
    pub glosas_created: usize,
    pub unmatched_guides: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRunError {
    pub clinic_id: Option<Uuid>,
    pub insurance_company_id: Option<Uuid>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchRunReport {
    pub reference_month: u32,
    pub reference_year: i32,
    pub units_processed: usize,
    pub batches_created: usize,
    pub guides_created: usize,
    pub skipped_existing: usize,
    pub skipped_empty: usize,
    pub notifications_failed: usize,
    pub errors: Vec<BatchRunError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(approved: usize, denied: usize, partial: usize) -> OutcomeCounts {
        OutcomeCounts { approved, denied, partial }
    }

    #[test]
    fn test_batch_status_derivation() {
        assert_eq!(BatchStatus::from_outcomes(&counts(3, 0, 0)), BatchStatus::Approved);
        assert_eq!(BatchStatus::from_outcomes(&counts(0, 2, 0)), BatchStatus::Denied);
        assert_eq!(BatchStatus::from_outcomes(&counts(2, 1, 0)), BatchStatus::Partial);
        assert_eq!(BatchStatus::from_outcomes(&counts(0, 0, 1)), BatchStatus::Partial);
        assert_eq!(BatchStatus::from_outcomes(&counts(1, 1, 1)), BatchStatus::Partial);
    }

    #[test]
    fn test_batch_status_derivation_exhaustive_small_grid() {
        for a in 0..4 {
            for d in 0..4 {
                for p in 0..4 {
                    let c = counts(a, d, p);
                    if c.total() == 0 {
                        continue;
                    }
                    let expected = if a == c.total() {
                        BatchStatus::Approved
                    } else if d == c.total() {
                        BatchStatus::Denied
                    } else {
                        BatchStatus::Partial
                    };
                    assert_eq!(BatchStatus::from_outcomes(&c), expected, "a={} d={} p={}", a, d, p);
                }
            }
        }
    }

    #[test]
    fn test_batch_transitions() {
        assert!(BatchStatus::Draft.can_transition_to(BatchStatus::Valid));
        assert!(BatchStatus::Draft.can_transition_to(BatchStatus::Invalid));
        assert!(!BatchStatus::Draft.can_transition_to(BatchStatus::Submitted));
        assert!(BatchStatus::Valid.can_transition_to(BatchStatus::Valid));
        assert!(BatchStatus::Submitted.can_transition_to(BatchStatus::Partial));
        assert!(!BatchStatus::Submitted.can_transition_to(BatchStatus::Valid));
        assert!(BatchStatus::Invalid.valid_transitions().is_empty());
        assert!(BatchStatus::Approved.valid_transitions().is_empty());
    }

    #[test]
    fn test_procedure_total_applies_reduction_factor() {
        let total = Procedure::compute_total(
            Decimal::new(2, 0),
            Decimal::new(10000, 2),
            Decimal::new(70, 2),
        );
        assert_eq!(total, Decimal::new(14000, 2));

        let rounded = Procedure::compute_total(Decimal::ONE, Decimal::new(3333, 2), Decimal::new(5, 1));
        assert_eq!(rounded, Decimal::new(1667, 2));
    }

    #[test]
    fn test_glosa_category_inference() {
        assert_eq!(GlosaCategory::infer(Some("Falta de autorização prévia")), GlosaCategory::Authorization);
        assert_eq!(GlosaCategory::infer(Some("Valor acima da tabela")), GlosaCategory::Pricing);
        assert_eq!(GlosaCategory::infer(Some("Beneficiário em carência")), GlosaCategory::Eligibility);
        assert_eq!(GlosaCategory::infer(Some("Guia sem assinatura")), GlosaCategory::Documentation);
        assert_eq!(GlosaCategory::infer(None), GlosaCategory::Other);
        assert!(!GlosaCategory::Eligibility.appealable_by_default());
        assert!(GlosaCategory::Pricing.appealable_by_default());
    }

    #[test]
    fn test_status_serialization_matches_store_values() {
        assert_eq!(serde_json::to_value(BatchStatus::Submitted).unwrap(), "submitted");
        assert_eq!(serde_json::to_value(GuideStatus::Partial).unwrap(), "partial");
        assert_eq!(serde_json::to_value(GlosaType::Total).unwrap(), "TOTAL");
        let parsed: GuideType = serde_json::from_str("\"consulta\"").unwrap();
        assert_eq!(parsed, GuideType::Consultation);
    }
}
