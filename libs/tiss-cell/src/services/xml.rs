use std::sync::Arc;

use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use rust_decimal::Decimal;
use serde_json::{json, Map};
use tracing::{info, instrument};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_database::SupabaseClient;

use crate::access::TissContext;
use crate::error::TissError;
use crate::models::{format_money, BatchStatus, Clinic, InsuranceOperator, TissBatch, TissGuide, XmlGenerationResult};
use crate::services::store::TissStore;

pub const TISS_NAMESPACE: &str = "http://www.ans.gov.br/padroes/tiss/schemas";
pub const TISS_VERSION: &str = "4.02.00";
/// TUSS procedure table.
pub const PROCEDURE_TABLE_CODE: &str = "22";
pub const TRANSACTION_TYPE: &str = "ENVIO_LOTE_GUIAS";

pub struct XmlBatchInput<'a> {
    pub batch: &'a TissBatch,
    pub guides: &'a [TissGuide],
    pub clinic: &'a Clinic,
    pub operator: &'a InsuranceOperator,
    pub generated_at: DateTime<Utc>,
}

fn quantity(value: Decimal) -> String {
    value.normalize().to_string()
}

struct TissWriter {
    writer: Writer<Vec<u8>>,
}

impl TissWriter {
    fn new() -> Self {
        Self { writer: Writer::new_with_indent(Vec::new(), b' ', 2) }
    }

    fn event(&mut self, event: Event<'_>) -> Result<(), TissError> {
        self.writer
            .write_event(event)
            .map_err(|e| TissError::Xml(e.to_string()))
    }

    fn open(&mut self, name: &str) -> Result<(), TissError> {
        self.event(Event::Start(BytesStart::new(format!("ans:{}", name))))
    }

    fn close(&mut self, name: &str) -> Result<(), TissError> {
        self.event(Event::End(BytesEnd::new(format!("ans:{}", name))))
    }

    fn element(&mut self, name: &str, text: &str) -> Result<(), TissError> {
        self.open(name)?;
        self.event(Event::Text(BytesText::from_escaped(escape(text))))?;
        self.close(name)
    }

    fn optional(&mut self, name: &str, text: Option<&str>) -> Result<(), TissError> {
        match text.map(str::trim).filter(|t| !t.is_empty()) {
            Some(text) => self.element(name, text),
            None => Ok(()),
        }
    }

    fn finish(self) -> Result<String, TissError> {
        String::from_utf8(self.writer.into_inner()).map_err(|e| TissError::Xml(e.to_string()))
    }
}

/// Serializes a batch and its guides into an ANS TISS `mensagemTISS` document.
pub struct TissXmlGenerator;

impl TissXmlGenerator {
    pub fn generate(input: &XmlBatchInput<'_>) -> Result<String, TissError> {
        let mut w = TissWriter::new();

        w.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        w.event(Event::Start(
            BytesStart::new("ans:mensagemTISS").with_attributes([("xmlns:ans", TISS_NAMESPACE)]),
        ))?;

        Self::write_header(&mut w, input)?;

        w.open("loteGuias")?;
        w.element("numeroLote", &input.batch.batch_number)?;
        for guide in input.guides {
            Self::write_guide(&mut w, guide)?;
        }
        w.close("loteGuias")?;

        w.event(Event::End(BytesEnd::new("ans:mensagemTISS")))?;
        w.finish()
    }

    fn write_header(w: &mut TissWriter, input: &XmlBatchInput<'_>) -> Result<(), TissError> {
        let batch = input.batch;
        let clinic = input.clinic;
        let operator = input.operator;

        w.open("cabecalho")?;

        w.open("identificacaoTransacao")?;
        w.element("tipoTransacao", TRANSACTION_TYPE)?;
        w.element("sequencialTransacao", &batch.batch_number)?;
        w.element("dataRegistroTransacao", &input.generated_at.format("%Y-%m-%d").to_string())?;
        w.element("horaRegistroTransacao", &input.generated_at.format("%H:%M:%S").to_string())?;
        w.close("identificacaoTransacao")?;

        w.open("origem")?;
        w.open("identificacaoPrestador")?;
        let provider_code = operator
            .provider_code
            .as_deref()
            .or(clinic.cnpj.as_deref())
            .unwrap_or_default();
        w.element("codigoPrestadorNaOperadora", provider_code)?;
        w.optional("CNPJ", clinic.cnpj.as_deref())?;
        w.optional("CNES", clinic.cnes.as_deref())?;
        w.element("nomeContratado", &clinic.name)?;
        w.close("identificacaoPrestador")?;
        w.close("origem")?;

        w.open("destino")?;
        w.element("registroANS", operator.ans_code.as_deref().unwrap_or_default())?;
        w.element("nomeOperadora", &operator.name)?;
        w.close("destino")?;

        w.element("Padrao", TISS_VERSION)?;
        w.close("cabecalho")
    }

    fn write_guide(w: &mut TissWriter, guide: &TissGuide) -> Result<(), TissError> {
        w.open("guia")?;
        w.element("numeroGuiaPrestador", &guide.guide_number)?;
        w.element("dataEmissao", &guide.execution_date.format("%Y-%m-%d").to_string())?;
        w.element("tipoGuia", &guide.guide_type.to_string())?;

        w.open("beneficiario")?;
        let card_number = guide
            .patient_insurance
            .as_ref()
            .and_then(|card| card.card_number.as_deref())
            .unwrap_or_default();
        w.element("numeroCarteira", card_number)?;
        let patient_name = guide
            .patient
            .as_ref()
            .and_then(|p| p.full_name.as_deref())
            .unwrap_or_default();
        w.element("nomeBeneficiario", patient_name)?;
        w.optional("cpf", guide.patient.as_ref().and_then(|p| p.cpf.as_deref()))?;
        w.close("beneficiario")?;

        w.open("procedimentos")?;
        for procedure in &guide.procedures {
            w.open("procedimento")?;
            w.element("codigoTabela", PROCEDURE_TABLE_CODE)?;
            w.element("codigoProcedimento", &procedure.procedure_code)?;
            w.element("descricaoProcedimento", &procedure.description)?;
            w.element("quantidade", &quantity(procedure.quantity))?;
            w.element("valorUnitario", &format_money(procedure.unit_price))?;
            w.element("valorTotal", &format_money(procedure.total_price))?;
            w.close("procedimento")?;
        }
        w.close("procedimentos")?;

        w.element("valorTotalGuia", &format_money(guide.billed_value()))?;

        let secondary = guide.cid_secondary.as_deref().unwrap_or_default();
        if guide.cid_primary.is_some() || !secondary.is_empty() {
            w.open("diagnostico")?;
            w.optional("cid10", guide.cid_primary.as_deref())?;
            for cid in secondary {
                w.optional("cid10Secundario", Some(cid.as_str()))?;
            }
            w.close("diagnostico")?;
        }

        w.optional("numeroAutorizacao", guide.authorization_number.as_deref())?;
        w.optional("observacao", guide.observation.as_deref())?;
        w.close("guia")
    }
}

/// Generates, stores and records the XML artifact of a batch.
pub struct XmlExportService {
    store: TissStore,
    bucket: String,
}

impl XmlExportService {
    pub fn new(config: &AppConfig) -> Self {
        let supabase = Arc::new(SupabaseClient::new(config));
        Self {
            store: TissStore::new(supabase),
            bucket: config.storage_bucket.clone(),
        }
    }

    pub fn object_path(clinic_id: Uuid, batch_number: &str) -> String {
        format!("{}/batches/{}.xml", clinic_id, batch_number)
    }

    #[instrument(skip(self, ctx, auth_token), fields(clinic_id = %ctx.clinic_id))]
    pub async fn generate_for_batch(
        &self,
        ctx: &TissContext,
        batch_id: Uuid,
        auth_token: &str,
    ) -> Result<XmlGenerationResult, TissError> {
        let batch = self.store.get_batch(batch_id, auth_token).await?;
        ctx.ensure_clinic(batch.clinic_id)?;

        if batch.status == BatchStatus::Invalid {
            return Err(TissError::InvalidBatch(format!("Lote {} está inválido", batch.batch_number)));
        }
        if !batch.status.can_transition_to(BatchStatus::Valid) {
            return Err(TissError::InvalidStatusTransition { from: batch.status, to: BatchStatus::Valid });
        }

        let guides = self.store.guides_for_batch(batch.id, auth_token).await?;
        if guides.is_empty() {
            return Err(TissError::InvalidBatch(format!("Lote {} não possui guias", batch.batch_number)));
        }

        let clinic = self.store.get_clinic(batch.clinic_id, auth_token).await?;
        let operator = self.store.get_operator(batch.insurance_company_id, auth_token).await?;

        let generated_at = Utc::now();
        let xml = TissXmlGenerator::generate(&XmlBatchInput {
            batch: &batch,
            guides: &guides,
            clinic: &clinic,
            operator: &operator,
            generated_at,
        })?;
        let file_size = xml.len();

        let object_path = Self::object_path(clinic.id, &batch.batch_number);
        let xml_url = self
            .store
            .client()
            .upload_object(&self.bucket, &object_path, xml.into_bytes(), "application/xml", true, auth_token)
            .await
            .map_err(|e| TissError::Storage(e.to_string()))?;

        let mut changes = Map::new();
        changes.insert("xml_file_url".to_string(), json!(xml_url));
        changes.insert("xml_file_size".to_string(), json!(file_size));
        changes.insert("xml_generated_at".to_string(), json!(generated_at.to_rfc3339()));
        self.store
            .transition_batch(&batch, BatchStatus::Valid, changes, auth_token)
            .await?;

        info!("Generated XML for batch {} ({} guides, {} bytes)", batch.batch_number, guides.len(), file_size);

        Ok(XmlGenerationResult {
            xml_url,
            file_size,
            guide_count: guides.len(),
            generated_at,
        })
    }

    pub async fn stored_xml_url(&self, ctx: &TissContext, batch_id: Uuid, auth_token: &str) -> Result<String, TissError> {
        let batch = self.store.get_batch(batch_id, auth_token).await?;
        ctx.ensure_clinic(batch.clinic_id)?;

        batch
            .xml_file_url
            .ok_or_else(|| TissError::InvalidBatch("O XML deste lote ainda não foi gerado".to_string()))
    }
}
