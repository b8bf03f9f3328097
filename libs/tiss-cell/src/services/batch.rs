use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::{SupabaseClient, SupabaseError};

use crate::access::TissContext;
use crate::error::TissError;
use crate::models::{
    round_money, BatchRunError, BatchRunReport, BatchStatus, BillableAppointment, Clinic,
    CreateBatchRequest, InsuranceOperator, TissBatch, TissGuide,
};
use crate::services::notification::BatchNotifier;
use crate::services::numbering::{
    allocate_with_retry, batch_number_prefix, format_batch_guide_number, format_batch_number,
    next_sequence, BATCH_SEQUENCE_WIDTH,
};
use crate::services::store::{TissStore, GUIDE_SELECT};

/// TUSS code for an office consultation, billed for job-generated guides.
pub const CONSULTATION_PROCEDURE_CODE: &str = "10101012";
pub const CONSULTATION_PROCEDURE_DESCRIPTION: &str = "Consulta em consultório (no horário normal ou preestabelecido)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferencePeriod {
    pub month: u32,
    pub year: i32,
}

impl ReferencePeriod {
    pub fn new(month: u32, year: i32) -> Result<Self, TissError> {
        if !(1..=12).contains(&month) {
            return Err(TissError::Validation("Mês de referência deve estar entre 1 e 12".to_string()));
        }
        if !(2000..=9999).contains(&year) {
            return Err(TissError::Validation("Ano de referência inválido".to_string()));
        }
        Ok(Self { month, year })
    }

    /// The calendar month before the one containing `date`.
    pub fn preceding(date: NaiveDate) -> Self {
        if date.month() == 1 {
            Self { month: 12, year: date.year() - 1 }
        } else {
            Self { month: date.month() - 1, year: date.year() }
        }
    }

    pub fn of(date: NaiveDate) -> Self {
        Self { month: date.month(), year: date.year() }
    }

    pub fn start(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// First day of the following month (exclusive bound).
    pub fn end(&self) -> NaiveDate {
        let (year, month) = if self.month == 12 { (self.year + 1, 1) } else { (self.year, self.month + 1) };
        NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MAX)
    }
}

enum UnitOutcome {
    Created { batch: TissBatch, guides: usize },
    SkippedExisting,
    SkippedEmpty,
}

pub struct BatchService {
    store: TissStore,
    notifier: BatchNotifier,
    enabled_plans: Vec<String>,
}

impl BatchService {
    pub fn new(config: &AppConfig) -> Self {
        let supabase = Arc::new(SupabaseClient::new(config));
        Self {
            store: TissStore::new(supabase),
            notifier: BatchNotifier::new(config),
            enabled_plans: config.tiss_enabled_plans.clone(),
        }
    }

    /// Builds the monthly batches for every entitled clinic and active insurer,
    /// or only for `clinic_id` when given.
    ///
    /// Each (clinic, insurer) unit runs in its own error boundary; failures are
    /// collected in the report and never abort the remaining units.
    #[instrument(skip(self, auth_token))]
    pub async fn run_monthly_batching(
        &self,
        reference_date: NaiveDate,
        clinic_id: Option<Uuid>,
        auth_token: &str,
    ) -> BatchRunReport {
        let period = ReferencePeriod::preceding(reference_date);
        let mut report = BatchRunReport {
            reference_month: period.month,
            reference_year: period.year,
            ..BatchRunReport::default()
        };

        info!("Starting monthly TISS batching for {:02}/{}", period.month, period.year);

        let clinics = match self.entitled_clinics(clinic_id, auth_token).await {
            Ok(clinics) => clinics,
            Err(e) => {
                error!("Could not load clinics for batching: {}", e);
                report.errors.push(BatchRunError {
                    clinic_id: None,
                    insurance_company_id: None,
                    message: e.to_string(),
                });
                return report;
            }
        };

        for clinic in &clinics {
            let operators = match self.active_operators(clinic.id, auth_token).await {
                Ok(operators) => operators,
                Err(e) => {
                    error!("Could not load insurers for clinic {}: {}", clinic.id, e);
                    report.errors.push(BatchRunError {
                        clinic_id: Some(clinic.id),
                        insurance_company_id: None,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            for operator in &operators {
                report.units_processed += 1;

                match self.process_unit(clinic, operator, period, auth_token).await {
                    Ok(UnitOutcome::Created { batch, guides }) => {
                        report.batches_created += 1;
                        report.guides_created += guides;

                        if let Err(e) = self.notifier.notify_batch_created(clinic, operator, &batch).await {
                            warn!("Batch {} created but notification failed: {}", batch.batch_number, e);
                            report.notifications_failed += 1;
                        }
                    }
                    Ok(UnitOutcome::SkippedExisting) => report.skipped_existing += 1,
                    Ok(UnitOutcome::SkippedEmpty) => report.skipped_empty += 1,
                    Err(e) => {
                        error!("Batching failed for clinic {} / insurer {}: {}", clinic.id, operator.id, e);
                        report.errors.push(BatchRunError {
                            clinic_id: Some(clinic.id),
                            insurance_company_id: Some(operator.id),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }

        info!(
            "Monthly batching {:02}/{} done: {} units, {} batches, {} guides, {} errors",
            period.month,
            period.year,
            report.units_processed,
            report.batches_created,
            report.guides_created,
            report.errors.len()
        );

        report
    }

    async fn entitled_clinics(&self, clinic_id: Option<Uuid>, auth_token: &str) -> Result<Vec<Clinic>, TissError> {
        if self.enabled_plans.is_empty() {
            warn!("No subscription plan is entitled to TISS batching");
            return Ok(Vec::new());
        }

        let mut path = format!(
            "/rest/v1/clinics?subscription_plan=in.({})&select=id,name,cnpj,cnes,email,subscription_plan",
            self.enabled_plans.join(",")
        );
        if let Some(clinic_id) = clinic_id {
            path.push_str(&format!("&id=eq.{}", clinic_id));
        }
        self.store.select(&path, auth_token).await
    }

    async fn active_operators(&self, clinic_id: Uuid, auth_token: &str) -> Result<Vec<InsuranceOperator>, TissError> {
        let path = format!("/rest/v1/insurance_companies?clinic_id=eq.{}&is_active=eq.true", clinic_id);
        self.store.select(&path, auth_token).await
    }

    /// Completed insurance appointments of the period that have no guide yet.
    async fn billable_appointments(
        &self,
        clinic_id: Uuid,
        operator_id: Uuid,
        period: ReferencePeriod,
        auth_token: &str,
    ) -> Result<Vec<BillableAppointment>, TissError> {
        let path = format!(
            "/rest/v1/appointments?clinic_id=eq.{}&insurance_company_id=eq.{}&status=eq.completed&payment_method=eq.insurance\
             &appointment_date=gte.{}&appointment_date=lt.{}\
             &select=id,clinic_id,patient_id,doctor_id,patient_insurance_id,insurance_company_id,appointment_date,payment_amount,cid_primary\
             &order=appointment_date.asc",
            clinic_id,
            operator_id,
            period.start(),
            period.end()
        );
        let appointments: Vec<BillableAppointment> = self.store.select(&path, auth_token).await?;
        if appointments.is_empty() {
            return Ok(appointments);
        }

        let ids: Vec<String> = appointments.iter().map(|a| a.id.to_string()).collect();
        let linked_path = format!(
            "/rest/v1/tiss_guides?appointment_id=in.({})&select=appointment_id",
            ids.join(",")
        );
        let linked: Vec<Value> = self.store.select(&linked_path, auth_token).await?;
        let linked: HashSet<String> = linked
            .iter()
            .filter_map(|row| row["appointment_id"].as_str().map(str::to_string))
            .collect();

        Ok(appointments
            .into_iter()
            .filter(|a| !linked.contains(&a.id.to_string()))
            .filter(|a| {
                if a.patient_insurance_id.is_none() {
                    warn!("Appointment {} has no insurance link; not billable", a.id);
                    return false;
                }
                true
            })
            .collect())
    }

    async fn process_unit(
        &self,
        clinic: &Clinic,
        operator: &InsuranceOperator,
        period: ReferencePeriod,
        auth_token: &str,
    ) -> Result<UnitOutcome, TissError> {
        if self
            .store
            .find_batch_for_period(clinic.id, operator.id, period.month, period.year, auth_token)
            .await?
            .is_some()
        {
            debug!("Batch already exists for clinic {} / insurer {}", clinic.id, operator.id);
            return Ok(UnitOutcome::SkippedExisting);
        }

        let appointments = self
            .billable_appointments(clinic.id, operator.id, period, auth_token)
            .await?;
        if appointments.is_empty() {
            return Ok(UnitOutcome::SkippedEmpty);
        }

        let amounts: Vec<Decimal> = appointments
            .iter()
            .map(|a| {
                a.payment_amount.map(round_money).unwrap_or_else(|| {
                    warn!("Appointment {} has no payment amount; billing 0.00", a.id);
                    Decimal::ZERO
                })
            })
            .collect();
        let total_value = round_money(amounts.iter().copied().sum());

        let batch = match self
            .insert_batch(clinic.id, operator.id, period, appointments.len(), total_value, auth_token)
            .await
        {
            Ok(batch) => batch,
            Err(TissError::Conflict(_)) => return Ok(UnitOutcome::SkippedExisting),
            Err(e) => return Err(e),
        };

        if let Err(e) = self.insert_job_guides(&batch, &appointments, &amounts, auth_token).await {
            self.invalidate_incomplete(&batch, auth_token).await;
            return Err(e);
        }

        info!("Created batch {} with {} guides ({})", batch.batch_number, appointments.len(), total_value);
        Ok(UnitOutcome::Created { batch, guides: appointments.len() })
    }

    async fn insert_job_guides(
        &self,
        batch: &TissBatch,
        appointments: &[BillableAppointment],
        amounts: &[Decimal],
        auth_token: &str,
    ) -> Result<(), TissError> {
        let now = Utc::now().to_rfc3339();
        let mut guide_rows = Vec::with_capacity(appointments.len());
        let mut procedure_rows = Vec::with_capacity(appointments.len());

        for (index, (appointment, amount)) in appointments.iter().zip(amounts).enumerate() {
            let guide_id = Uuid::new_v4();

            guide_rows.push(json!({
                "id": guide_id,
                "guide_number": format_batch_guide_number(&batch.batch_number, index + 1),
                "guide_type": "consultation",
                "clinic_id": batch.clinic_id,
                "operator_id": batch.insurance_company_id,
                "patient_id": appointment.patient_id,
                "patient_insurance_id": appointment.patient_insurance_id,
                "doctor_id": appointment.doctor_id,
                "appointment_id": appointment.id,
                "batch_id": batch.id,
                "cid_primary": appointment.cid_primary,
                "execution_date": appointment.appointment_date.date_naive(),
                "total_value": amount,
                "status": "pending",
                "created_at": now,
                "updated_at": now,
            }));

            procedure_rows.push(json!({
                "guide_id": guide_id,
                "procedure_code": CONSULTATION_PROCEDURE_CODE,
                "description": CONSULTATION_PROCEDURE_DESCRIPTION,
                "quantity": 1,
                "unit_price": amount,
                "reduction_factor": 1,
                "total_price": amount,
            }));
        }

        self.store.insert_many("tiss_guides", guide_rows, auth_token).await?;
        self.store.insert_many("tiss_procedures", procedure_rows, auth_token).await
    }

    /// Inserts a DRAFT batch under the next free number of the clinic's period.
    /// A batch already present for the (clinic, insurer, period) tuple is a
    /// `Conflict`; a number taken concurrently is retried.
    async fn insert_batch(
        &self,
        clinic_id: Uuid,
        operator_id: Uuid,
        period: ReferencePeriod,
        total_guides: usize,
        total_value: Decimal,
        auth_token: &str,
    ) -> Result<TissBatch, TissError> {
        let prefix = batch_number_prefix(period.year, period.month);
        let now = Utc::now().to_rfc3339();
        let base_row = json!({
            "clinic_id": clinic_id,
            "insurance_company_id": operator_id,
            "reference_month": period.month,
            "reference_year": period.year,
            "total_guides": total_guides,
            "total_value": total_value,
            "status": BatchStatus::Draft,
            "created_at": now,
            "updated_at": now,
        });

        let store = &self.store;
        let base_row = &base_row;
        let prefix_ref = prefix.as_str();

        allocate_with_retry(&prefix, |attempt| async move {
            let latest = store.latest_batch_number(clinic_id, period.month, period.year, auth_token).await?;
            let sequence = next_sequence(latest.as_deref(), prefix_ref, BATCH_SEQUENCE_WIDTH)?;
            let batch_number = format_batch_number(period.year, period.month, sequence);
            debug!("Allocating batch number {} (attempt {})", batch_number, attempt);

            let mut row = base_row.clone();
            row["batch_number"] = json!(batch_number);

            match store.insert::<TissBatch>("tiss_batches", row, auth_token).await {
                Err(TissError::Database(SupabaseError::Conflict(detail))) => {
                    let existing = store
                        .find_batch_for_period(clinic_id, operator_id, period.month, period.year, auth_token)
                        .await?;
                    match existing {
                        Some(batch) => Err(TissError::Conflict(format!(
                            "Já existe o lote {} para {:02}/{}",
                            batch.batch_number, period.month, period.year
                        ))),
                        None => Err(TissError::Database(SupabaseError::Conflict(detail))),
                    }
                }
                other => other,
            }
        })
        .await
    }

    /// Batches the clinic's unbatched PENDING guides for one insurer and month.
    #[instrument(skip(self, ctx, auth_token), fields(clinic_id = %ctx.clinic_id))]
    pub async fn create_batch_from_guides(
        &self,
        ctx: &TissContext,
        request: CreateBatchRequest,
        auth_token: &str,
    ) -> Result<TissBatch, TissError> {
        let period = ReferencePeriod::new(request.reference_month, request.reference_year)?;

        let operator = self.store.get_operator(request.operator_id, auth_token).await?;
        ctx.ensure_clinic(operator.clinic_id)?;

        if let Some(existing) = self
            .store
            .find_batch_for_period(ctx.clinic_id, operator.id, period.month, period.year, auth_token)
            .await?
        {
            return Err(TissError::Conflict(format!(
                "Já existe o lote {} para {:02}/{}",
                existing.batch_number, period.month, period.year
            )));
        }

        let path = format!(
            "/rest/v1/tiss_guides?clinic_id=eq.{}&operator_id=eq.{}&batch_id=is.null&status=eq.pending\
             &execution_date=gte.{}&execution_date=lt.{}&{}&order=guide_number.asc",
            ctx.clinic_id,
            operator.id,
            period.start(),
            period.end(),
            GUIDE_SELECT
        );
        let guides: Vec<TissGuide> = self.store.select(&path, auth_token).await?;
        let guides: Vec<TissGuide> = guides
            .into_iter()
            .filter(|guide| {
                if guide.procedures.is_empty() {
                    warn!("Guide {} has no procedures; left out of the batch", guide.guide_number);
                    return false;
                }
                true
            })
            .collect();
        if guides.is_empty() {
            return Err(TissError::InvalidBatch("Nenhuma guia elegível para o período".to_string()));
        }

        let totals: Vec<Decimal> = guides.iter().map(TissGuide::procedures_total).collect();
        let total_value = round_money(totals.iter().copied().sum());

        let batch = self
            .insert_batch(ctx.clinic_id, operator.id, period, guides.len(), total_value, auth_token)
            .await?;

        let (claimed, claimed_value) = match self.claim_guides(&batch, &guides, &totals, auth_token).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.invalidate_incomplete(&batch, auth_token).await;
                return Err(e);
            }
        };

        if claimed == 0 {
            self.invalidate_incomplete(&batch, auth_token).await;
            return Err(TissError::Conflict(
                "As guias do período foram incluídas em outro lote".to_string(),
            ));
        }

        if claimed < guides.len() {
            warn!(
                "Batch {} claimed {} of {} guides; the rest were batched concurrently",
                batch.batch_number,
                claimed,
                guides.len()
            );
            return self.store_totals(&batch, claimed, claimed_value, auth_token).await;
        }

        info!("Batch {} created from {} guides ({})", batch.batch_number, claimed, claimed_value);
        Ok(batch)
    }

    /// Links each still-unbatched guide to `batch`. Returns how many guides
    /// were actually linked and their summed value.
    async fn claim_guides(
        &self,
        batch: &TissBatch,
        guides: &[TissGuide],
        totals: &[Decimal],
        auth_token: &str,
    ) -> Result<(usize, Decimal), TissError> {
        let mut claimed = 0;
        let mut claimed_value = Decimal::ZERO;

        for (guide, total) in guides.iter().zip(totals) {
            let filter = format!("id=eq.{}&batch_id=is.null", guide.id);
            let rows: Vec<Value> = self
                .store
                .update_returning(
                    "tiss_guides",
                    &filter,
                    json!({
                        "batch_id": batch.id,
                        "total_value": total,
                        "updated_at": Utc::now().to_rfc3339(),
                    }),
                    auth_token,
                )
                .await?;

            if rows.is_empty() {
                debug!("Guide {} already belongs to another batch", guide.guide_number);
                continue;
            }
            claimed += 1;
            claimed_value += *total;
        }

        Ok((claimed, round_money(claimed_value)))
    }

    async fn store_totals(
        &self,
        batch: &TissBatch,
        total_guides: usize,
        total_value: Decimal,
        auth_token: &str,
    ) -> Result<TissBatch, TissError> {
        let filter = format!("id=eq.{}", batch.id);
        let updated: Vec<TissBatch> = self
            .store
            .update_returning(
                "tiss_batches",
                &filter,
                json!({
                    "total_guides": total_guides,
                    "total_value": total_value,
                    "updated_at": Utc::now().to_rfc3339(),
                }),
                auth_token,
            )
            .await?;

        updated
            .into_iter()
            .next()
            .ok_or_else(|| TissError::NotFound("Lote não encontrado".to_string()))
    }

    /// A batch missing guides it counts must never be submitted.
    async fn invalidate_incomplete(&self, batch: &TissBatch, auth_token: &str) {
        if let Err(e) = self.store.transition_batch(batch, BatchStatus::Invalid, Map::new(), auth_token).await {
            error!("Could not invalidate incomplete batch {}: {}", batch.batch_number, e);
        }
    }

    /// Recomputes the aggregates from the guides currently linked to the batch.
    pub async fn recalculate_totals(
        &self,
        ctx: &TissContext,
        batch_id: Uuid,
        auth_token: &str,
    ) -> Result<TissBatch, TissError> {
        let batch = self.get_batch(ctx, batch_id, auth_token).await?;
        if !matches!(batch.status, BatchStatus::Draft | BatchStatus::Valid | BatchStatus::Invalid) {
            return Err(TissError::InvalidBatch(format!(
                "Lote {} já foi enviado e não pode ser recalculado",
                batch.batch_number
            )));
        }

        let guides = self.store.guides_for_batch(batch.id, auth_token).await?;
        let total_value = round_money(guides.iter().map(TissGuide::billed_value).sum());
        let updated = self.store_totals(&batch, guides.len(), total_value, auth_token).await?;

        info!("Recalculated batch {}: {} guides, {}", updated.batch_number, updated.total_guides, updated.total_value);
        Ok(updated)
    }

    pub async fn get_batch(&self, ctx: &TissContext, batch_id: Uuid, auth_token: &str) -> Result<TissBatch, TissError> {
        let batch = self.store.get_batch(batch_id, auth_token).await?;
        ctx.ensure_clinic(batch.clinic_id)?;
        Ok(batch)
    }

    pub async fn submit_batch(&self, ctx: &TissContext, batch_id: Uuid, auth_token: &str) -> Result<TissBatch, TissError> {
        let batch = self.get_batch(ctx, batch_id, auth_token).await?;
        if batch.status == BatchStatus::Valid && batch.xml_file_url.is_none() {
            return Err(TissError::InvalidBatch("Gere o XML do lote antes de enviá-lo".to_string()));
        }

        let mut changes = Map::new();
        changes.insert("submitted_at".to_string(), json!(Utc::now().to_rfc3339()));
        self.store
            .transition_batch(&batch, BatchStatus::Submitted, changes, auth_token)
            .await
    }
}
