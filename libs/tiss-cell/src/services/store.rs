use std::sync::Arc;

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use uuid::Uuid;

use shared_database::SupabaseClient;

use crate::error::TissError;
use crate::models::{BatchStatus, Clinic, InsuranceOperator, TissBatch, TissGuide, TissReturn};

/// Guide rows always come back with procedures and beneficiary data embedded.
pub const GUIDE_SELECT: &str = "select=*,procedures:tiss_procedures(*),patient:patients(full_name,cpf),patient_insurance:patient_insurance(card_number)";

/// Row access to the TISS tables shared by the services.
#[derive(Clone)]
pub struct TissStore {
    supabase: Arc<SupabaseClient>,
}

impl TissStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    pub fn client(&self) -> &SupabaseClient {
        &self.supabase
    }

    fn prefer(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static(value));
        headers
    }

    pub async fn select<T>(&self, path: &str, auth_token: &str) -> Result<Vec<T>, TissError>
    where T: DeserializeOwned {
        let rows: Vec<T> = self.supabase
            .request(Method::GET, path, Some(auth_token), None)
            .await?;
        Ok(rows)
    }

    pub async fn select_one<T>(&self, path: &str, auth_token: &str) -> Result<Option<T>, TissError>
    where T: DeserializeOwned {
        let rows: Vec<T> = self.select(path, auth_token).await?;
        Ok(rows.into_iter().next())
    }

    /// Inserts one row and returns it as stored.
    pub async fn insert<T>(&self, table: &str, row: Value, auth_token: &str) -> Result<T, TissError>
    where T: DeserializeOwned {
        let path = format!("/rest/v1/{}", table);
        let rows: Vec<T> = self.supabase.request_with_headers(
            Method::POST,
            &path,
            Some(auth_token),
            Some(row),
            Some(Self::prefer("return=representation")),
        ).await?;

        rows.into_iter()
            .next()
            .ok_or_else(|| TissError::Validation(format!("Nenhum registro retornado ao inserir em {}", table)))
    }

    pub async fn insert_many(&self, table: &str, rows: Vec<Value>, auth_token: &str) -> Result<(), TissError> {
        if rows.is_empty() {
            return Ok(());
        }

        let path = format!("/rest/v1/{}", table);
        let _: Value = self.supabase.request_with_headers(
            Method::POST,
            &path,
            Some(auth_token),
            Some(Value::Array(rows)),
            Some(Self::prefer("return=minimal")),
        ).await?;
        Ok(())
    }

    /// Insert that leaves existing rows with the same conflict key untouched.
    pub async fn insert_ignoring_duplicates(
        &self,
        table: &str,
        on_conflict: &str,
        rows: Vec<Value>,
        auth_token: &str,
    ) -> Result<(), TissError> {
        if rows.is_empty() {
            return Ok(());
        }

        let path = format!("/rest/v1/{}?on_conflict={}", table, on_conflict);
        let _: Value = self.supabase.request_with_headers(
            Method::POST,
            &path,
            Some(auth_token),
            Some(Value::Array(rows)),
            Some(Self::prefer("resolution=ignore-duplicates,return=minimal")),
        ).await?;
        Ok(())
    }

    pub async fn update(&self, table: &str, filter: &str, changes: Value, auth_token: &str) -> Result<(), TissError> {
        let path = format!("/rest/v1/{}?{}", table, filter);
        let _: Value = self.supabase.request_with_headers(
            Method::PATCH,
            &path,
            Some(auth_token),
            Some(changes),
            Some(Self::prefer("return=minimal")),
        ).await?;
        Ok(())
    }

    pub async fn delete(&self, table: &str, filter: &str, auth_token: &str) -> Result<(), TissError> {
        let path = format!("/rest/v1/{}?{}", table, filter);
        let _: Value = self.supabase.request_with_headers(
            Method::DELETE,
            &path,
            Some(auth_token),
            None,
            Some(Self::prefer("return=minimal")),
        ).await?;
        Ok(())
    }

    pub async fn update_returning<T>(
        &self,
        table: &str,
        filter: &str,
        changes: Value,
        auth_token: &str,
    ) -> Result<Vec<T>, TissError>
    where T: DeserializeOwned {
        let path = format!("/rest/v1/{}?{}", table, filter);
        let rows: Vec<T> = self.supabase.request_with_headers(
            Method::PATCH,
            &path,
            Some(auth_token),
            Some(changes),
            Some(Self::prefer("return=representation")),
        ).await?;
        Ok(rows)
    }

    pub async fn get_clinic(&self, clinic_id: Uuid, auth_token: &str) -> Result<Clinic, TissError> {
        let path = format!("/rest/v1/clinics?id=eq.{}&select=id,name,cnpj,cnes,email,subscription_plan", clinic_id);
        self.select_one(&path, auth_token)
            .await?
            .ok_or_else(|| TissError::NotFound("Clínica não encontrada".to_string()))
    }

    pub async fn get_operator(&self, operator_id: Uuid, auth_token: &str) -> Result<InsuranceOperator, TissError> {
        let path = format!("/rest/v1/insurance_companies?id=eq.{}", operator_id);
        self.select_one(&path, auth_token)
            .await?
            .ok_or_else(|| TissError::NotFound("Operadora não encontrada".to_string()))
    }

    pub async fn get_batch(&self, batch_id: Uuid, auth_token: &str) -> Result<TissBatch, TissError> {
        let path = format!("/rest/v1/tiss_batches?id=eq.{}", batch_id);
        self.select_one(&path, auth_token)
            .await?
            .ok_or_else(|| TissError::NotFound("Lote não encontrado".to_string()))
    }

    pub async fn find_batch_for_period(
        &self,
        clinic_id: Uuid,
        operator_id: Uuid,
        month: u32,
        year: i32,
        auth_token: &str,
    ) -> Result<Option<TissBatch>, TissError> {
        let path = format!(
            "/rest/v1/tiss_batches?clinic_id=eq.{}&insurance_company_id=eq.{}&reference_month=eq.{}&reference_year=eq.{}&limit=1",
            clinic_id, operator_id, month, year
        );
        self.select_one(&path, auth_token).await
    }

    /// Highest batch number already used by the clinic in the period, across insurers.
    pub async fn latest_batch_number(
        &self,
        clinic_id: Uuid,
        month: u32,
        year: i32,
        auth_token: &str,
    ) -> Result<Option<String>, TissError> {
        let path = format!(
            "/rest/v1/tiss_batches?clinic_id=eq.{}&reference_month=eq.{}&reference_year=eq.{}&select=batch_number&order=batch_number.desc&limit=1",
            clinic_id, month, year
        );
        let row: Option<Value> = self.select_one(&path, auth_token).await?;
        Ok(row.and_then(|r| r["batch_number"].as_str().map(str::to_string)))
    }

    pub async fn get_guide(&self, guide_id: Uuid, auth_token: &str) -> Result<TissGuide, TissError> {
        let path = format!("/rest/v1/tiss_guides?id=eq.{}&{}", guide_id, GUIDE_SELECT);
        self.select_one(&path, auth_token)
            .await?
            .ok_or_else(|| TissError::NotFound("Guia não encontrada".to_string()))
    }

    pub async fn guides_for_batch(&self, batch_id: Uuid, auth_token: &str) -> Result<Vec<TissGuide>, TissError> {
        let path = format!(
            "/rest/v1/tiss_guides?batch_id=eq.{}&{}&order=guide_number.asc",
            batch_id, GUIDE_SELECT
        );
        self.select(&path, auth_token).await
    }

    pub async fn get_return(&self, return_id: Uuid, auth_token: &str) -> Result<TissReturn, TissError> {
        let path = format!("/rest/v1/tiss_returns?id=eq.{}", return_id);
        self.select_one(&path, auth_token)
            .await?
            .ok_or_else(|| TissError::NotFound("Retorno não encontrado".to_string()))
    }

    /// Moves a batch to `next`, guarded on its current status so a concurrent
    /// change is reported instead of overwritten.
    pub async fn transition_batch(
        &self,
        batch: &TissBatch,
        next: BatchStatus,
        mut changes: Map<String, Value>,
        auth_token: &str,
    ) -> Result<TissBatch, TissError> {
        if !batch.status.can_transition_to(next) {
            return Err(TissError::InvalidStatusTransition { from: batch.status, to: next });
        }

        changes.insert("status".to_string(), json!(next));
        changes.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));

        let filter = format!("id=eq.{}&status=eq.{}", batch.id, batch.status);
        debug!("Transitioning batch {} from {} to {}", batch.id, batch.status, next);

        let updated: Vec<TissBatch> = self
            .update_returning("tiss_batches", &filter, Value::Object(changes), auth_token)
            .await?;

        let updated = updated.into_iter().next().ok_or_else(|| {
            TissError::Conflict(format!("O lote {} foi alterado por outra operação", batch.batch_number))
        })?;

        info!("Batch {} is now {}", updated.batch_number, updated.status);
        Ok(updated)
    }

    pub async fn record_timeline_event(
        &self,
        clinic_id: Uuid,
        event_type: &str,
        entity_id: Uuid,
        payload: Value,
        auth_token: &str,
    ) -> Result<(), TissError> {
        let row = json!({
            "clinic_id": clinic_id,
            "event_type": event_type,
            "entity_id": entity_id,
            "payload": payload,
            "created_at": Utc::now().to_rfc3339(),
        });
        self.insert_many("tiss_timeline_events", vec![row], auth_token).await
    }
}
