//! Insurer return ingestion.
//!
//! A return is reconciled entirely in memory first ([`reconcile`]); only a
//! complete reconciliation is written. Every write is absolute or
//! duplicate-ignoring, so a return that ended in `ERROR` can be run again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::SupabaseClient;

use crate::access::TissContext;
use crate::error::TissError;
use crate::models::{
    round_money, BatchStatus, CreateReturnRequest, Glosa, GlosaCategory, GlosaListQuery, GlosaType,
    GuideStatus, OutcomeCounts, ReturnProcessingStatus, ReturnProcessingSummary, TissBatch, TissGuide,
    TissReturn,
};
use crate::services::deep_search::{
    extract_boolean, extract_number, extract_text, find_all_keys, find_first_key, find_key, local_name,
    normalize_array, parse_document,
};
use crate::services::store::TissStore;

/// Nodes that hold one insurer verdict per guide, most specific first.
pub const GUIDE_CONTAINER_KEYS: [&str; 5] = ["guia", "dadosGuia", "relacaoGuias", "guias", "guides"];
const GUIDE_NUMBER_KEYS: [&str; 5] = [
    "numeroGuiaPrestador",
    "numeroGuia",
    "guide_number",
    "guideNumber",
    "numeroGuiaOperadora",
];
const GLOSA_REASON_KEYS: [&str; 4] = ["motivoGlosa", "motivosGlosa", "glosas", "glosa"];
const INFORMED_VALUE_KEYS: [&str; 3] = ["valorInformado", "valorApresentado", "valorProcessado"];
const RELEASED_VALUE_KEYS: [&str; 3] = ["valorLiberado", "valorPago", "valorAprovado"];
const SITUATION_KEYS: [&str; 5] = ["situacaoGuia", "statusGuia", "situacao", "status", "outcome"];
const GLOSA_CODE_KEYS: [&str; 3] = ["codigoGlosa", "codGlosa", "glosa_code"];
const GLOSA_DESCRIPTION_KEYS: [&str; 3] = ["descricaoGlosa", "descricaoMotivo", "glosa_description"];
const GLOSA_CATEGORY_KEYS: [&str; 3] = ["categoriaGlosa", "categoria", "glosa_category"];
const APPEAL_KEYS: [&str; 3] = ["permiteRecurso", "podeRecorrer", "can_appeal"];

#[derive(Debug, Clone)]
pub struct InsurerGuideEntry<'a> {
    pub guide_number: String,
    pub node: &'a Value,
}

/// Every per-guide node of the payload keyed by its guide number. The first
/// node seen for a number wins.
pub fn extract_guide_entries(doc: &Value) -> Vec<InsurerGuideEntry<'_>> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for container in GUIDE_CONTAINER_KEYS {
        for found in find_all_keys(doc, container) {
            for node in normalize_array(found) {
                let Some(number) = find_first_key(node, &GUIDE_NUMBER_KEYS).and_then(extract_text) else {
                    continue;
                };
                if seen.insert(number.clone()) {
                    entries.push(InsurerGuideEntry { guide_number: number, node });
                }
            }
        }
    }

    entries
}

/// Copy of `node` without glosa-reason subtrees, so guide-level amounts are
/// not confused with per-reason amounts.
fn without_reasons(node: &Value) -> Value {
    match node {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !GLOSA_REASON_KEYS.contains(&local_name(key)))
                .map(|(key, value)| (key.clone(), without_reasons(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(without_reasons).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Situation {
    Approved,
    Denied,
    Partial,
}

const APPROVAL_STEMS: [&str; 5] = ["aprovad", "liberad", "autorizad", "approved", "paid"];
const NEGATIONS: [&str; 3] = ["não", "nao", "not"];

/// "NÃO AUTORIZADA", "nao-aprovado", "not approved".
fn negates_approval(text: &str) -> bool {
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();

    words.windows(2).any(|pair| {
        NEGATIONS.contains(&pair[0]) && APPROVAL_STEMS.iter().any(|stem| pair[1].starts_with(stem))
    })
}

fn parse_situation(raw: &str) -> Option<Situation> {
    let text = raw.trim().to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| text.contains(needle));

    if has(&["parcial", "partial"]) {
        Some(Situation::Partial)
    } else if has(&["negad", "glosad", "recusad", "rejeitad", "denied", "rejected"]) || negates_approval(&text) {
        Some(Situation::Denied)
    } else if has(&APPROVAL_STEMS) || text == "paga" || text == "pago" {
        Some(Situation::Approved)
    } else {
        None
    }
}

fn number_at(node: &Value, keys: &[&str]) -> Option<Decimal> {
    find_first_key(node, keys).and_then(extract_number)
}

/// Glosa amount reported for one guide, before clamping.
fn reported_glosa(node: &Value, original: Decimal, guide_number: &str) -> Result<Decimal, TissError> {
    let guide_level = without_reasons(node);

    if let Some(amount) = find_key(&guide_level, "valorGlosa").and_then(extract_number) {
        return Ok(amount);
    }

    if let (Some(informed), Some(released)) = (
        number_at(&guide_level, &INFORMED_VALUE_KEYS),
        number_at(&guide_level, &RELEASED_VALUE_KEYS),
    ) {
        return Ok(informed - released);
    }

    // First reason container that carries amounts; nested containers would double count
    let reason_total = GLOSA_REASON_KEYS.iter().find_map(|key| {
        let amounts: Vec<Decimal> = find_all_keys(node, key)
            .into_iter()
            .flat_map(normalize_array)
            .filter_map(|reason| find_key(reason, "valorGlosa").and_then(extract_number))
            .collect();
        (!amounts.is_empty()).then(|| amounts.into_iter().sum::<Decimal>())
    });
    if let Some(total) = reason_total {
        return Ok(total);
    }

    let situation = find_first_key(&guide_level, &SITUATION_KEYS).and_then(extract_text);
    match situation.as_deref().map(|s| (s, parse_situation(s))) {
        Some((_, Some(Situation::Approved))) => Ok(Decimal::ZERO),
        Some((_, Some(Situation::Denied))) => Ok(original),
        Some((_, Some(Situation::Partial))) => Err(TissError::Parse(format!(
            "Guia {} glosada parcialmente sem valor de glosa informado",
            guide_number
        ))),
        Some((raw, None)) => Err(TissError::Parse(format!(
            "Situação '{}' da guia {} não reconhecida",
            raw, guide_number
        ))),
        None => Err(TissError::Parse(format!("Retorno sem resultado para a guia {}", guide_number))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlosaReason {
    pub code: Option<String>,
    pub description: Option<String>,
    pub category: GlosaCategory,
    pub can_appeal: bool,
}

fn glosa_reason(node: &Value) -> GlosaReason {
    let code = find_first_key(node, &GLOSA_CODE_KEYS).and_then(extract_text);
    let description = find_first_key(node, &GLOSA_DESCRIPTION_KEYS).and_then(extract_text);
    let category = find_first_key(node, &GLOSA_CATEGORY_KEYS)
        .and_then(extract_text)
        .and_then(|raw| GlosaCategory::parse(&raw))
        .unwrap_or_else(|| GlosaCategory::infer(description.as_deref()));
    let can_appeal = find_first_key(node, &APPEAL_KEYS)
        .and_then(extract_boolean)
        .unwrap_or_else(|| category.appealable_by_default());

    GlosaReason { code, description, category, can_appeal }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuideResolution {
    pub status: GuideStatus,
    pub original_value: Decimal,
    pub glosa_value: Decimal,
    pub approved_value: Decimal,
    pub reason: Option<GlosaReason>,
}

impl GuideResolution {
    pub fn glosa_type(&self) -> Option<GlosaType> {
        match self.status {
            GuideStatus::Denied => Some(GlosaType::Total),
            GuideStatus::Partial => Some(GlosaType::Partial),
            GuideStatus::Approved | GuideStatus::Pending => None,
        }
    }
}

/// Insurer verdict for one guide billed at `original`.
pub fn resolve_outcome(node: &Value, original: Decimal, guide_number: &str) -> Result<GuideResolution, TissError> {
    let original = round_money(original);
    let reported = reported_glosa(node, original, guide_number)?;
    let glosa_value = round_money(reported.clamp(Decimal::ZERO, original));

    let status = if glosa_value.is_zero() {
        GuideStatus::Approved
    } else if glosa_value == original {
        GuideStatus::Denied
    } else {
        GuideStatus::Partial
    };

    let reason = (status != GuideStatus::Approved).then(|| glosa_reason(node));

    Ok(GuideResolution {
        status,
        original_value: original,
        glosa_value,
        approved_value: original - glosa_value,
        reason,
    })
}

#[derive(Debug, Clone)]
pub struct GuideReconciliation {
    pub guide_id: Uuid,
    pub guide_number: String,
    pub resolution: GuideResolution,
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub guides: Vec<GuideReconciliation>,
    pub counts: OutcomeCounts,
    pub amount_requested: Decimal,
    pub amount_approved: Decimal,
    pub amount_denied: Decimal,
    pub unmatched_guides: Vec<String>,
    pub batch_status: BatchStatus,
}

impl Reconciliation {
    pub fn glosa_count(&self) -> usize {
        self.guides
            .iter()
            .filter(|g| g.resolution.glosa_type().is_some())
            .count()
    }
}

/// Matches the batch's guides against the insurer payload. Nothing is written.
pub fn reconcile(guides: &[TissGuide], doc: &Value) -> Result<Reconciliation, TissError> {
    let entries: HashMap<String, &Value> = extract_guide_entries(doc)
        .into_iter()
        .map(|entry| (entry.guide_number, entry.node))
        .collect();

    let mut reconciled = Vec::new();
    let mut unmatched = Vec::new();
    let mut counts = OutcomeCounts::default();
    let mut amount_requested = Decimal::ZERO;
    let mut amount_approved = Decimal::ZERO;
    let mut amount_denied = Decimal::ZERO;

    for guide in guides {
        let Some(node) = entries.get(&guide.guide_number) else {
            unmatched.push(guide.guide_number.clone());
            continue;
        };

        let resolution = resolve_outcome(node, guide.billed_value(), &guide.guide_number)?;
        counts.record(resolution.status);
        amount_requested += resolution.original_value;
        amount_approved += resolution.approved_value;
        amount_denied += resolution.glosa_value;

        reconciled.push(GuideReconciliation {
            guide_id: guide.id,
            guide_number: guide.guide_number.clone(),
            resolution,
        });
    }

    if reconciled.is_empty() {
        return Err(TissError::Parse("Nenhuma guia do lote foi encontrada no retorno".to_string()));
    }

    // Guides left pending make the batch outcome mixed
    let batch_status = if unmatched.is_empty() {
        BatchStatus::from_outcomes(&counts)
    } else {
        BatchStatus::Partial
    };

    Ok(Reconciliation {
        guides: reconciled,
        counts,
        amount_requested: round_money(amount_requested),
        amount_approved: round_money(amount_approved),
        amount_denied: round_money(amount_denied),
        unmatched_guides: unmatched,
        batch_status,
    })
}

pub struct ReturnProcessingService {
    store: TissStore,
}

impl ReturnProcessingService {
    pub fn new(config: &AppConfig) -> Self {
        let supabase = Arc::new(SupabaseClient::new(config));
        Self { store: TissStore::new(supabase) }
    }

    pub async fn register_return(
        &self,
        ctx: &TissContext,
        request: CreateReturnRequest,
        auth_token: &str,
    ) -> Result<TissReturn, TissError> {
        if request.file_name.trim().is_empty() {
            return Err(TissError::Validation("Nome do arquivo é obrigatório".to_string()));
        }
        let content = request.content.filter(|c| !c.trim().is_empty());
        let file_url = request.file_url.filter(|u| !u.trim().is_empty());
        if content.is_none() && file_url.is_none() {
            return Err(TissError::Validation("Informe o conteúdo ou a URL do arquivo de retorno".to_string()));
        }

        let batch = self.store.get_batch(request.batch_id, auth_token).await?;
        ctx.ensure_clinic(batch.clinic_id)?;

        let row = json!({
            "clinic_id": batch.clinic_id,
            "batch_id": batch.id,
            "file_name": request.file_name.trim(),
            "file_url": file_url,
            "raw_content": content,
            "processing_status": ReturnProcessingStatus::Pending,
            "created_at": Utc::now().to_rfc3339(),
        });

        let tiss_return: TissReturn = self.store.insert("tiss_returns", row, auth_token).await?;
        info!("Registered return {} for batch {}", tiss_return.id, batch.batch_number);
        Ok(tiss_return)
    }

    /// Processes a PENDING return, or re-runs one that ended in ERROR.
    #[instrument(skip(self, ctx, auth_token), fields(clinic_id = %ctx.clinic_id))]
    pub async fn process_return(
        &self,
        ctx: &TissContext,
        return_id: Uuid,
        auth_token: &str,
    ) -> Result<ReturnProcessingSummary, TissError> {
        let tiss_return = self.store.get_return(return_id, auth_token).await?;
        ctx.ensure_clinic(tiss_return.clinic_id)?;

        if !tiss_return.processing_status.can_start_processing() {
            return Err(TissError::Conflict(format!(
                "Retorno já está em processamento ou concluído ({})",
                tiss_return.processing_status
            )));
        }

        self.claim(&tiss_return, auth_token).await?;

        match self.apply(&tiss_return, auth_token).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!("Return {} failed: {}", return_id, e);
                let changes = json!({
                    "processing_status": ReturnProcessingStatus::Error,
                    "processing_error": e.to_string(),
                });
                let filter = format!("id=eq.{}", return_id);
                if let Err(mark) = self.store.update("tiss_returns", &filter, changes, auth_token).await {
                    error!("Could not record failure of return {}: {}", return_id, mark);
                }
                Err(e)
            }
        }
    }

    /// PENDING|ERROR -> PROCESSING, guarded so two runs cannot both start.
    async fn claim(&self, tiss_return: &TissReturn, auth_token: &str) -> Result<(), TissError> {
        let filter = format!(
            "id=eq.{}&processing_status=in.({},{})",
            tiss_return.id,
            ReturnProcessingStatus::Pending,
            ReturnProcessingStatus::Error
        );
        let claimed: Vec<Value> = self
            .store
            .update_returning(
                "tiss_returns",
                &filter,
                json!({ "processing_status": ReturnProcessingStatus::Processing, "processing_error": null }),
                auth_token,
            )
            .await?;

        if claimed.is_empty() {
            return Err(TissError::Conflict("Retorno já está em processamento".to_string()));
        }
        Ok(())
    }

    async fn load_content(&self, tiss_return: &TissReturn, auth_token: &str) -> Result<String, TissError> {
        if let Some(content) = tiss_return.raw_content.as_deref().filter(|c| !c.trim().is_empty()) {
            return Ok(content.to_string());
        }

        let url = tiss_return
            .file_url
            .as_deref()
            .ok_or_else(|| TissError::Validation("Retorno sem conteúdo".to_string()))?;
        self.store
            .client()
            .download_text(url, Some(auth_token))
            .await
            .map_err(|e| TissError::Storage(e.to_string()))
    }

    fn target_status(batch: &TissBatch, next: BatchStatus) -> Result<(), TissError> {
        // A re-run after a partially applied attempt finds the batch already there
        if batch.status == next || batch.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(TissError::InvalidStatusTransition { from: batch.status, to: next })
        }
    }

    async fn apply(&self, tiss_return: &TissReturn, auth_token: &str) -> Result<ReturnProcessingSummary, TissError> {
        let batch = self.store.get_batch(tiss_return.batch_id, auth_token).await?;
        let content = self.load_content(tiss_return, auth_token).await?;
        let doc = parse_document(&content)?;
        let guides = self.store.guides_for_batch(batch.id, auth_token).await?;

        let reconciliation = reconcile(&guides, &doc)?;
        Self::target_status(&batch, reconciliation.batch_status)?;

        debug!(
            "Return {} reconciled: {:?}, {} unmatched",
            tiss_return.id,
            reconciliation.counts,
            reconciliation.unmatched_guides.len()
        );

        let processed_at = Utc::now().to_rfc3339();

        for guide in &reconciliation.guides {
            let filter = format!("id=eq.{}", guide.guide_id);
            self.store
                .update(
                    "tiss_guides",
                    &filter,
                    json!({
                        "status": guide.resolution.status,
                        "glosa_value": guide.resolution.glosa_value,
                        "processed_at": processed_at,
                        "updated_at": processed_at,
                    }),
                    auth_token,
                )
                .await?;
        }

        let glosa_rows: Vec<Value> = reconciliation
            .guides
            .iter()
            .filter_map(|guide| {
                let glosa_type = guide.resolution.glosa_type()?;
                let reason = guide.resolution.reason.as_ref()?;
                Some(json!({
                    "guide_id": guide.guide_id,
                    "batch_id": batch.id,
                    "return_id": tiss_return.id,
                    "clinic_id": batch.clinic_id,
                    "glosa_type": glosa_type,
                    "glosa_code": reason.code,
                    "glosa_description": reason.description,
                    "category": reason.category,
                    "glosa_value": guide.resolution.glosa_value,
                    "original_value": guide.resolution.original_value,
                    "approved_value": guide.resolution.approved_value,
                    "can_appeal": reason.can_appeal,
                    "created_at": processed_at,
                }))
            })
            .collect();
        let glosas_created = glosa_rows.len();
        self.store
            .insert_ignoring_duplicates("tiss_glosas", "return_id,guide_id", glosa_rows, auth_token)
            .await?;

        if batch.status != reconciliation.batch_status {
            self.store
                .transition_batch(&batch, reconciliation.batch_status, Map::new(), auth_token)
                .await?;
        }

        let counts = reconciliation.counts;
        let filter = format!("id=eq.{}", tiss_return.id);
        self.store
            .update(
                "tiss_returns",
                &filter,
                json!({
                    "processing_status": ReturnProcessingStatus::Completed,
                    "processing_error": null,
                    "total_guides_processed": counts.total(),
                    "total_approved": counts.approved,
                    "total_denied": counts.denied,
                    "total_partial": counts.partial,
                    "amount_requested": reconciliation.amount_requested,
                    "amount_approved": reconciliation.amount_approved,
                    "amount_denied": reconciliation.amount_denied,
                    "parsed_data": doc,
                    "processed_at": processed_at,
                }),
                auth_token,
            )
            .await?;

        let event = json!({
            "return_id": tiss_return.id,
            "batch_id": batch.id,
            "batch_status": reconciliation.batch_status,
            "approved": counts.approved,
            "denied": counts.denied,
            "partial": counts.partial,
            "unmatched": reconciliation.unmatched_guides.len(),
        });
        if let Err(e) = self
            .store
            .record_timeline_event(batch.clinic_id, "tiss_return_processed", tiss_return.id, event, auth_token)
            .await
        {
            warn!("Timeline event for return {} not recorded: {}", tiss_return.id, e);
        }

        info!(
            "Return {} completed: batch {} -> {}, approved {}, denied {}",
            tiss_return.id,
            batch.batch_number,
            reconciliation.batch_status,
            reconciliation.amount_approved,
            reconciliation.amount_denied
        );

        Ok(ReturnProcessingSummary {
            return_id: tiss_return.id,
            batch_id: batch.id,
            batch_status: reconciliation.batch_status,
            total_guides_processed: counts.total(),
            total_approved: counts.approved,
            total_denied: counts.denied,
            total_partial: counts.partial,
            amount_requested: reconciliation.amount_requested,
            amount_approved: reconciliation.amount_approved,
            amount_denied: reconciliation.amount_denied,
            glosas_created,
            unmatched_guides: reconciliation.unmatched_guides,
        })
    }

    pub async fn list_glosas(
        &self,
        ctx: &TissContext,
        query: GlosaListQuery,
        auth_token: &str,
    ) -> Result<Vec<Glosa>, TissError> {
        let mut path = format!("/rest/v1/tiss_glosas?clinic_id=eq.{}", ctx.clinic_id);
        if let Some(batch_id) = query.batch_id {
            path.push_str(&format!("&batch_id=eq.{}", batch_id));
        }
        if let Some(guide_id) = query.guide_id {
            path.push_str(&format!("&guide_id=eq.{}", guide_id));
        }
        path.push_str("&order=created_at.desc");

        self.store.select(&path, auth_token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::str::FromStr;

    use crate::models::{GuideType, Procedure};

    fn dec(raw: &str) -> Decimal {
        Decimal::from_str(raw).unwrap()
    }

    fn guide(number: &str, total: &str) -> TissGuide {
        TissGuide {
            id: Uuid::new_v4(),
            guide_number: number.to_string(),
            guide_type: GuideType::Consultation,
            clinic_id: Uuid::new_v4(),
            operator_id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            patient_insurance_id: Uuid::new_v4(),
            doctor_id: None,
            appointment_id: None,
            batch_id: None,
            cid_primary: None,
            cid_secondary: None,
            authorization_number: None,
            execution_date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            total_value: Some(dec(total)),
            status: GuideStatus::Pending,
            glosa_value: None,
            observation: None,
            processed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            procedures: Vec::<Procedure>::new(),
            patient: None,
            patient_insurance: None,
        }
    }

    #[test]
    fn test_mixed_outcomes_reconcile_to_partial_batch() {
        let guides = vec![guide("0001", "150.00"), guide("0002", "150.00"), guide("0003", "150.00")];
        let doc = json!({
            "demonstrativo": {
                "guias": [
                    {"numeroGuiaPrestador": "0001", "situacaoGuia": "APROVADA"},
                    {"numeroGuiaPrestador": "0002", "situacaoGuia": "NEGADA",
                     "motivoGlosa": {"codigoGlosa": "1801", "descricaoGlosa": "Falta de autorização"}},
                    {"numeroGuiaPrestador": "0003", "valorGlosa": "0,00"}
                ]
            }
        });

        let rec = reconcile(&guides, &doc).unwrap();
        assert_eq!(rec.counts, OutcomeCounts { approved: 2, denied: 1, partial: 0 });
        assert_eq!(rec.batch_status, BatchStatus::Partial);
        assert_eq!(rec.amount_requested, dec("450.00"));
        assert_eq!(rec.amount_approved, dec("300.00"));
        assert_eq!(rec.amount_denied, dec("150.00"));
        assert_eq!(rec.glosa_count(), 1);

        let denied = &rec.guides[1].resolution;
        assert_eq!(denied.glosa_type(), Some(GlosaType::Total));
        assert_eq!(denied.approved_value, Decimal::ZERO);
        let reason = denied.reason.as_ref().unwrap();
        assert_eq!(reason.code.as_deref(), Some("1801"));
        assert_eq!(reason.category, GlosaCategory::Authorization);
        assert!(reason.can_appeal);
    }

    #[test]
    fn test_amount_precedence() {
        let original = dec("200.00");

        let explicit = json!({"valorGlosa": "R$ 50,00", "valorInformado": "200", "valorLiberado": "100"});
        assert_eq!(resolve_outcome(&explicit, original, "1").unwrap().glosa_value, dec("50.00"));

        let difference = json!({"valorInformado": "200,00", "valorLiberado": "120,00"});
        let resolution = resolve_outcome(&difference, original, "1").unwrap();
        assert_eq!(resolution.status, GuideStatus::Partial);
        assert_eq!(resolution.glosa_value, dec("80.00"));
        assert_eq!(resolution.approved_value + resolution.glosa_value, original);

        let reasons = json!({
            "situacaoGuia": "Glosada parcialmente",
            "motivoGlosa": [
                {"codigoGlosa": "1", "valorGlosa": "10,00"},
                {"codigoGlosa": "2", "valorGlosa": "15,50"}
            ]
        });
        assert_eq!(resolve_outcome(&reasons, original, "1").unwrap().glosa_value, dec("25.50"));
    }

    #[test]
    fn test_negated_approval_is_a_denial() {
        for text in ["NÃO AUTORIZADA", "Não aprovada", "nao-aprovado", "Not approved"] {
            let node = json!({"numeroGuiaPrestador": "1", "situacaoGuia": text});
            let resolution = resolve_outcome(&node, dec("150"), "1").unwrap();
            assert_eq!(resolution.status, GuideStatus::Denied, "{}", text);
            assert_eq!(resolution.glosa_value, dec("150.00"), "{}", text);
            assert_eq!(resolution.approved_value, Decimal::ZERO, "{}", text);
        }

        let approved = json!({"numeroGuiaPrestador": "1", "situacaoGuia": "AUTORIZADA"});
        assert_eq!(resolve_outcome(&approved, dec("150"), "1").unwrap().status, GuideStatus::Approved);
    }

    #[test]
    fn test_partial_without_amount_is_rejected() {
        let node = json!({"situacaoGuia": "PARCIAL"});
        assert!(matches!(resolve_outcome(&node, dec("100"), "1"), Err(TissError::Parse(_))));

        let silent = json!({"numeroGuiaPrestador": "1"});
        assert!(matches!(resolve_outcome(&silent, dec("100"), "1"), Err(TissError::Parse(_))));

        let unknown = json!({"situacaoGuia": "EM ANÁLISE"});
        assert!(matches!(resolve_outcome(&unknown, dec("100"), "1"), Err(TissError::Parse(_))));
    }

    #[test]
    fn test_glosa_is_clamped_to_guide_value() {
        let over = json!({"valorGlosa": "999"});
        let resolution = resolve_outcome(&over, dec("100"), "1").unwrap();
        assert_eq!(resolution.status, GuideStatus::Denied);
        assert_eq!(resolution.glosa_value, dec("100.00"));

        let negative = json!({"valorInformado": "100", "valorLiberado": "130"});
        assert_eq!(resolve_outcome(&negative, dec("100"), "1").unwrap().status, GuideStatus::Approved);
    }

    #[test]
    fn test_reason_category_and_appeal_policy() {
        let eligibility = json!({
            "situacaoGuia": "negada",
            "motivoGlosa": {"codigoGlosa": "1013", "descricaoGlosa": "Beneficiário em carência"}
        });
        let reason = resolve_outcome(&eligibility, dec("80"), "1").unwrap().reason.unwrap();
        assert_eq!(reason.category, GlosaCategory::Eligibility);
        assert!(!reason.can_appeal);

        let explicit = json!({
            "valorGlosa": "10",
            "motivoGlosa": {"categoria": "documentacao", "permiteRecurso": "N"}
        });
        let reason = resolve_outcome(&explicit, dec("80"), "1").unwrap().reason.unwrap();
        assert_eq!(reason.category, GlosaCategory::Documentation);
        assert!(!reason.can_appeal);
    }

    #[test]
    fn test_single_guide_container_and_namespaces() {
        let guides = vec![guide("2025000001", "100")];
        let doc = json!({
            "ans:mensagemTISS": {
                "ans:operadoraParaPrestador": {
                    "ans:demonstrativoAnaliseConta": {
                        "ans:relacaoGuias": {
                            "ans:numeroGuiaPrestador": "2025000001",
                            "ans:valorInformado": "100,00",
                            "ans:valorLiberado": "100,00"
                        }
                    }
                }
            }
        });

        let rec = reconcile(&guides, &doc).unwrap();
        assert_eq!(rec.batch_status, BatchStatus::Approved);
        assert_eq!(rec.glosa_count(), 0);
    }

    #[test]
    fn test_unmatched_guides_are_reported() {
        let guides = vec![guide("A", "100"), guide("B", "100")];
        let doc = json!({"guias": {"numeroGuia": "A", "situacao": "aprovada"}});

        let rec = reconcile(&guides, &doc).unwrap();
        assert_eq!(rec.unmatched_guides, vec!["B".to_string()]);
        assert_eq!(rec.counts.total(), 1);
        assert_eq!(rec.batch_status, BatchStatus::Partial);

        let foreign = json!({"guias": {"numeroGuia": "Z", "situacao": "aprovada"}});
        assert!(matches!(reconcile(&guides, &foreign), Err(TissError::Parse(_))));
    }

    #[test]
    fn test_first_entry_per_guide_number_wins() {
        let doc = json!({
            "relacaoGuias": [{"numeroGuiaPrestador": "1", "guia": {"numeroGuiaPrestador": "1", "valorGlosa": "5"}}]
        });
        let entries = extract_guide_entries(&doc);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node, &json!({"numeroGuiaPrestador": "1", "valorGlosa": "5"}));
    }
}
