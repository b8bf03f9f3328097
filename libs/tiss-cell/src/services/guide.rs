use std::sync::Arc;

use chrono::{Datelike, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::SupabaseClient;

use crate::access::TissContext;
use crate::error::TissError;
use crate::models::{
    CreateGuideRequest, GuideListQuery, GuidePage, GuideType, PatientInsurance, Procedure,
    ProcedureInput, TissGuide,
};
use crate::services::numbering::{
    allocate_with_retry, format_guide_number, guide_number_prefix, next_sequence, GUIDE_SEQUENCE_WIDTH,
};
use crate::services::store::{TissStore, GUIDE_SELECT};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Builds priced procedure lines, applying each line's reduction factor.
pub fn build_procedures(inputs: &[ProcedureInput]) -> Result<Vec<Procedure>, TissError> {
    if inputs.is_empty() {
        return Err(TissError::Validation("Informe ao menos um procedimento".to_string()));
    }

    inputs
        .iter()
        .enumerate()
        .map(|(index, input)| {
            let line = index + 1;

            if input.procedure_code.trim().is_empty() {
                return Err(TissError::Validation(format!("Procedimento {}: código obrigatório", line)));
            }
            if input.quantity <= Decimal::ZERO {
                return Err(TissError::Validation(format!("Procedimento {}: quantidade deve ser maior que zero", line)));
            }
            if input.unit_price < Decimal::ZERO {
                return Err(TissError::Validation(format!("Procedimento {}: valor unitário negativo", line)));
            }

            let reduction_factor = input.reduction_factor.unwrap_or(Decimal::ONE);
            if reduction_factor <= Decimal::ZERO || reduction_factor > Decimal::ONE {
                return Err(TissError::Validation(format!(
                    "Procedimento {}: fator de redução deve estar entre 0 e 1",
                    line
                )));
            }

            Ok(Procedure {
                id: None,
                guide_id: None,
                procedure_code: input.procedure_code.trim().to_string(),
                description: input.description.trim().to_string(),
                quantity: input.quantity,
                unit_price: input.unit_price,
                reduction_factor,
                total_price: Procedure::compute_total(input.quantity, input.unit_price, reduction_factor),
            })
        })
        .collect()
}

struct ValidatedGuide {
    guide_type: GuideType,
    patient_id: Uuid,
    patient_insurance_id: Uuid,
    procedures: Vec<Procedure>,
}

fn validate_request(request: &CreateGuideRequest) -> Result<ValidatedGuide, TissError> {
    let guide_type = request
        .guide_type
        .ok_or_else(|| TissError::Validation("Tipo de guia é obrigatório".to_string()))?;
    let patient_id = request
        .patient_id
        .ok_or_else(|| TissError::Validation("Paciente é obrigatório".to_string()))?;
    let patient_insurance_id = request
        .patient_insurance_id
        .ok_or_else(|| TissError::Validation("Convênio do paciente é obrigatório".to_string()))?;

    Ok(ValidatedGuide {
        guide_type,
        patient_id,
        patient_insurance_id,
        procedures: build_procedures(&request.procedures)?,
    })
}

fn list_filter(clinic_id: Uuid, query: &GuideListQuery) -> String {
    let mut filters = vec![format!("clinic_id=eq.{}", clinic_id)];

    if let Some(status) = query.status {
        filters.push(format!("status=eq.{}", status));
    }
    if let Some(operator_id) = query.operator_id {
        filters.push(format!("operator_id=eq.{}", operator_id));
    }
    if let Some(patient_id) = query.patient_id {
        filters.push(format!("patient_id=eq.{}", patient_id));
    }
    if let Some(from) = query.from {
        filters.push(format!("execution_date=gte.{}", from));
    }
    if let Some(to) = query.to {
        filters.push(format!("execution_date=lte.{}", to));
    }

    filters.join("&")
}

pub struct GuideService {
    store: TissStore,
}

impl GuideService {
    pub fn new(config: &AppConfig) -> Self {
        let supabase = Arc::new(SupabaseClient::new(config));
        Self { store: TissStore::new(supabase) }
    }

    #[instrument(skip(self, request, auth_token), fields(clinic_id = %ctx.clinic_id))]
    pub async fn create_guide(
        &self,
        ctx: &TissContext,
        request: CreateGuideRequest,
        auth_token: &str,
    ) -> Result<TissGuide, TissError> {
        let validated = validate_request(&request)?;

        let insurance = self
            .active_insurance(validated.patient_id, validated.patient_insurance_id, auth_token)
            .await?;

        let execution_date = request.execution_date.unwrap_or_else(|| Utc::now().date_naive());
        // Numbered in the year of creation, even for late-registered services
        let year = Utc::now().year();
        let prefix = guide_number_prefix(year);
        let now = Utc::now().to_rfc3339();

        let base_row = json!({
            "guide_type": validated.guide_type,
            "clinic_id": ctx.clinic_id,
            "operator_id": insurance.insurance_company_id,
            "patient_id": validated.patient_id,
            "patient_insurance_id": validated.patient_insurance_id,
            "doctor_id": request.doctor_id,
            "appointment_id": request.appointment_id,
            "cid_primary": request.cid_primary,
            "cid_secondary": request.cid_secondary,
            "authorization_number": request.authorization_number,
            "execution_date": execution_date,
            "observation": request.observation,
            "status": "pending",
            "created_at": now,
            "updated_at": now,
        });

        let store = &self.store;
        let base_row = &base_row;
        let prefix_ref = prefix.as_str();
        let clinic_id = ctx.clinic_id;

        let mut guide: TissGuide = allocate_with_retry(&prefix, |attempt| async move {
            let latest = Self::latest_guide_number(store, clinic_id, prefix_ref, auth_token).await?;
            let sequence = next_sequence(latest.as_deref(), prefix_ref, GUIDE_SEQUENCE_WIDTH)?;
            let guide_number = format_guide_number(year, sequence);
            debug!("Allocating guide number {} (attempt {})", guide_number, attempt);

            let mut row = base_row.clone();
            row["guide_number"] = json!(guide_number);
            store.insert::<TissGuide>("tiss_guides", row, auth_token).await
        })
        .await?;

        let procedure_rows: Vec<Value> = validated
            .procedures
            .iter()
            .map(|p| {
                json!({
                    "guide_id": guide.id,
                    "procedure_code": p.procedure_code,
                    "description": p.description,
                    "quantity": p.quantity,
                    "unit_price": p.unit_price,
                    "reduction_factor": p.reduction_factor,
                    "total_price": p.total_price,
                })
            })
            .collect();
        if let Err(e) = self.store.insert_many("tiss_procedures", procedure_rows, auth_token).await {
            // A guide without procedures would bill 0.00
            let filter = format!("id=eq.{}", guide.id);
            if let Err(cleanup) = self.store.delete("tiss_guides", &filter, auth_token).await {
                error!("Guide {} left without procedures: {}", guide.guide_number, cleanup);
            }
            return Err(e);
        }

        guide.procedures = validated
            .procedures
            .into_iter()
            .map(|p| Procedure { guide_id: Some(guide.id), ..p })
            .collect();

        info!("Created TISS guide {} ({} procedures, {})",
              guide.guide_number, guide.procedures.len(), guide.procedures_total());

        Ok(guide)
    }

    async fn active_insurance(
        &self,
        patient_id: Uuid,
        patient_insurance_id: Uuid,
        auth_token: &str,
    ) -> Result<PatientInsurance, TissError> {
        let path = format!(
            "/rest/v1/patient_insurance?id=eq.{}&patient_id=eq.{}&is_active=eq.true",
            patient_insurance_id, patient_id
        );
        self.store
            .select_one(&path, auth_token)
            .await?
            .ok_or_else(|| TissError::NotFound("Paciente sem convênio ativo correspondente".to_string()))
    }

    /// Only numbers of the `YYYY` + 6 digit shape; job-generated guide numbers
    /// are longer and live in their batch's scope.
    async fn latest_guide_number(
        store: &TissStore,
        clinic_id: Uuid,
        prefix: &str,
        auth_token: &str,
    ) -> Result<Option<String>, TissError> {
        let pattern = format!("{}{}", prefix, "_".repeat(GUIDE_SEQUENCE_WIDTH));
        let path = format!(
            "/rest/v1/tiss_guides?clinic_id=eq.{}&guide_number=like.{}&select=guide_number&order=guide_number.desc&limit=1",
            clinic_id, pattern
        );
        let row: Option<Value> = store.select_one(&path, auth_token).await?;
        Ok(row.and_then(|r| r["guide_number"].as_str().map(str::to_string)))
    }

    pub async fn list_guides(
        &self,
        ctx: &TissContext,
        query: GuideListQuery,
        auth_token: &str,
    ) -> Result<GuidePage, TissError> {
        let page = query.page.unwrap_or(1).max(1);
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1) * limit;

        let path = format!(
            "/rest/v1/tiss_guides?{}&{}&order=execution_date.desc,guide_number.desc&limit={}&offset={}",
            list_filter(ctx.clinic_id, &query),
            GUIDE_SELECT,
            limit,
            offset
        );
        debug!("Listing guides: {}", path);

        let (guides, total) = self
            .store
            .client()
            .select_with_count::<TissGuide>(&path, Some(auth_token))
            .await?;

        let total = total.unwrap_or(offset as u64 + guides.len() as u64);
        Ok(GuidePage { guides, page, limit, total })
    }

    pub async fn get_guide(&self, ctx: &TissContext, guide_id: Uuid, auth_token: &str) -> Result<TissGuide, TissError> {
        let guide = self.store.get_guide(guide_id, auth_token).await?;
        ctx.ensure_clinic(guide.clinic_id)?;
        Ok(guide)
    }
}
