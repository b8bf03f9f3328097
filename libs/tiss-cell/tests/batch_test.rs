use assert_matches::assert_matches;
use chrono::NaiveDate;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use shared_utils::test_utils::{MockSupabaseResponses, TestConfig, TestUser};
use tiss_cell::models::{BatchStatus, CreateBatchRequest};
use tiss_cell::services::BatchService;
use tiss_cell::{TissContext, TissError};

const TOKEN: &str = "service-token";

fn context(user: TestUser) -> TissContext {
    TissContext::from_user(&user.to_user()).unwrap()
}

fn appointment(clinic_id: &str, operator_id: &str, date: &str, amount: Option<&str>, insured: bool) -> serde_json::Value {
    json!({
        "id": Uuid::new_v4(),
        "clinic_id": clinic_id,
        "patient_id": Uuid::new_v4(),
        "doctor_id": Uuid::new_v4(),
        "patient_insurance_id": if insured { Some(Uuid::new_v4()) } else { None },
        "insurance_company_id": operator_id,
        "appointment_date": date,
        "payment_amount": amount,
        "cid_primary": null
    })
}

fn reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 2, 3).unwrap()
}

async fn mount_clinic_with_operator(mock_server: &MockServer, clinic_id: &str, operator_id: &str) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/clinics"))
        .and(query_param("subscription_plan", "in.(professional,enterprise)"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::clinic_response(clinic_id, "Clínica Bem Estar")
        ])))
        .mount(mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/insurance_companies"))
        .and(query_param("clinic_id", format!("eq.{}", clinic_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::operator_response(operator_id, clinic_id)
        ])))
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn test_monthly_run_creates_batch_and_notifies() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&mock_server.uri()).to_app_config();

    let clinic_id = Uuid::new_v4().to_string();
    let operator_id = Uuid::new_v4().to_string();
    let batch_id = Uuid::new_v4().to_string();

    mount_clinic_with_operator(&mock_server, &clinic_id, &operator_id).await;

    // No batch for 01/2025 yet and no number used in the period
    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_batches"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .and(query_param("status", "eq.completed"))
        .and(query_param("payment_method", "eq.insurance"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment(&clinic_id, &operator_id, "2025-01-10T13:00:00Z", Some("150.00"), true),
            appointment(&clinic_id, &operator_id, "2025-01-20T09:30:00Z", Some("150.00"), true),
            appointment(&clinic_id, &operator_id, "2025-01-22T16:00:00Z", Some("200.00"), false)
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_guides"))
        .and(query_param("select", "appointment_id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/tiss_batches"))
        .and(body_partial_json(json!({
            "batch_number": "202501001",
            "reference_month": 1,
            "reference_year": 2025,
            "total_guides": 2,
            "total_value": "300.00",
            "status": "draft"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([
            MockSupabaseResponses::batch_response(&batch_id, &clinic_id, &operator_id, "draft")
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/tiss_guides"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/tiss_procedures"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/emails"))
        .and(body_partial_json(json!({ "to": ["admin@clinica.test"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "msg_1" })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let service = BatchService::new(&config);
    let report = service.run_monthly_batching(reference_date(), None, TOKEN).await;

    assert_eq!(report.reference_month, 1);
    assert_eq!(report.reference_year, 2025);
    assert_eq!(report.units_processed, 1);
    assert_eq!(report.batches_created, 1);
    assert_eq!(report.guides_created, 2);
    assert_eq!(report.notifications_failed, 0);
    assert!(report.errors.is_empty());

    assert_eq!(
        posted_guide_numbers(&mock_server).await,
        vec!["2025010010001".to_string(), "2025010010002".to_string()]
    );
}

async fn posted_guide_numbers(mock_server: &MockServer) -> Vec<String> {
    let requests = mock_server.received_requests().await.unwrap();
    let insert = requests
        .iter()
        .find(|r| r.method.as_str() == "POST" && r.url.path() == "/rest/v1/tiss_guides")
        .expect("guide insert");
    let rows: Vec<serde_json::Value> = serde_json::from_slice(&insert.body).unwrap();
    rows.iter()
        .map(|row| row["guide_number"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_second_insurer_takes_next_batch_number() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&mock_server.uri()).to_app_config();

    let clinic_id = Uuid::new_v4().to_string();
    let operator_id = Uuid::new_v4().to_string();
    let batch_id = Uuid::new_v4().to_string();

    mount_clinic_with_operator(&mock_server, &clinic_id, &operator_id).await;

    // Another insurer of the clinic already owns 202501001
    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_batches"))
        .and(query_param("select", "batch_number"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "batch_number": "202501001" }])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_batches"))
        .and(query_param("insurance_company_id", format!("eq.{}", operator_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment(&clinic_id, &operator_id, "2025-01-10T13:00:00Z", Some("150.00"), true),
            appointment(&clinic_id, &operator_id, "2025-01-11T13:00:00Z", Some("120.50"), true)
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_guides"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let mut created = MockSupabaseResponses::batch_response(&batch_id, &clinic_id, &operator_id, "draft");
    created["batch_number"] = json!("202501002");

    Mock::given(method("POST"))
        .and(path("/rest/v1/tiss_batches"))
        .and(body_partial_json(json!({ "batch_number": "202501002", "total_value": "270.50" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([created])))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/tiss_guides"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/tiss_procedures"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/emails"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "msg_2" })))
        .mount(&mock_server)
        .await;

    let service = BatchService::new(&config);
    let report = service.run_monthly_batching(reference_date(), None, TOKEN).await;

    assert_eq!(report.batches_created, 1);
    assert!(report.errors.is_empty());
    assert_eq!(
        posted_guide_numbers(&mock_server).await,
        vec!["2025010020001".to_string(), "2025010020002".to_string()]
    );
}

#[tokio::test]
async fn test_monthly_run_treats_lost_insert_race_as_existing() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&mock_server.uri()).to_app_config();

    let clinic_id = Uuid::new_v4().to_string();
    let operator_id = Uuid::new_v4().to_string();

    mount_clinic_with_operator(&mock_server, &clinic_id, &operator_id).await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_batches"))
        .and(query_param("select", "batch_number"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    // Absent on the first look, present once the concurrent run has inserted it
    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_batches"))
        .and(query_param("insurance_company_id", format!("eq.{}", operator_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_batches"))
        .and(query_param("insurance_company_id", format!("eq.{}", operator_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::batch_response(&Uuid::new_v4().to_string(), &clinic_id, &operator_id, "draft")
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            appointment(&clinic_id, &operator_id, "2025-01-10T13:00:00Z", Some("150.00"), true)
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_guides"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/tiss_batches"))
        .respond_with(ResponseTemplate::new(409).set_body_json(
            MockSupabaseResponses::error_response("duplicate key value violates unique constraint", "23505")
        ))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/tiss_guides"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let service = BatchService::new(&config);
    let report = service.run_monthly_batching(reference_date(), None, TOKEN).await;

    assert_eq!(report.units_processed, 1);
    assert_eq!(report.skipped_existing, 1);
    assert_eq!(report.batches_created, 0);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn test_monthly_run_skips_existing_batch() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&mock_server.uri()).to_app_config();

    let clinic_id = Uuid::new_v4().to_string();
    let operator_id = Uuid::new_v4().to_string();

    mount_clinic_with_operator(&mock_server, &clinic_id, &operator_id).await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_batches"))
        .and(query_param("insurance_company_id", format!("eq.{}", operator_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::batch_response(&Uuid::new_v4().to_string(), &clinic_id, &operator_id, "submitted")
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/tiss_batches"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&mock_server)
        .await;

    let service = BatchService::new(&config);
    let report = service.run_monthly_batching(reference_date(), None, TOKEN).await;

    assert_eq!(report.units_processed, 1);
    assert_eq!(report.skipped_existing, 1);
    assert_eq!(report.batches_created, 0);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn test_monthly_run_isolates_failing_clinic() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&mock_server.uri()).to_app_config();

    let failing_clinic = Uuid::new_v4().to_string();
    let healthy_clinic = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/clinics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::clinic_response(&failing_clinic, "Clínica A"),
            MockSupabaseResponses::clinic_response(&healthy_clinic, "Clínica B")
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/insurance_companies"))
        .and(query_param("clinic_id", format!("eq.{}", failing_clinic)))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/insurance_companies"))
        .and(query_param("clinic_id", format!("eq.{}", healthy_clinic)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let service = BatchService::new(&config);
    let report = service.run_monthly_batching(reference_date(), None, TOKEN).await;

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].clinic_id, Some(Uuid::parse_str(&failing_clinic).unwrap()));
    assert_eq!(report.units_processed, 0);
}

#[tokio::test]
async fn test_clinic_scoped_run_only_loads_that_clinic() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&mock_server.uri()).to_app_config();

    let clinic_id = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/clinics"))
        .and(query_param("id", format!("eq.{}", clinic_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::clinic_response(&clinic_id, "Clínica Bem Estar")
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/insurance_companies"))
        .and(query_param("clinic_id", format!("eq.{}", clinic_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let service = BatchService::new(&config);
    let scope = Uuid::parse_str(&clinic_id).unwrap();
    let report = service.run_monthly_batching(reference_date(), Some(scope), TOKEN).await;

    assert!(report.errors.is_empty());
    assert_eq!(report.units_processed, 0);
}

#[tokio::test]
async fn test_create_batch_from_pending_guides() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&mock_server.uri()).to_app_config();

    let clinic_id = Uuid::new_v4().to_string();
    let operator_id = Uuid::new_v4().to_string();
    let batch_id = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/insurance_companies"))
        .and(query_param("id", format!("eq.{}", operator_id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::operator_response(&operator_id, &clinic_id)
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_batches"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_guides"))
        .and(query_param("batch_id", "is.null"))
        .and(query_param("status", "eq.pending"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::guide_response(
                &Uuid::new_v4().to_string(), &clinic_id, &operator_id, None, "2025000001", "150.00"
            ),
            MockSupabaseResponses::guide_response(
                &Uuid::new_v4().to_string(), &clinic_id, &operator_id, None, "2025000002", "150.00"
            )
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/tiss_batches"))
        .and(body_partial_json(json!({ "total_guides": 2, "status": "draft" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!([
            MockSupabaseResponses::batch_response(&batch_id, &clinic_id, &operator_id, "draft")
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/tiss_guides"))
        .and(query_param("batch_id", "is.null"))
        .and(body_partial_json(json!({ "batch_id": batch_id })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "batch_id": batch_id }])))
        .expect(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/tiss_batches"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let service = BatchService::new(&config);
    let request = CreateBatchRequest {
        operator_id: Uuid::parse_str(&operator_id).unwrap(),
        reference_month: 1,
        reference_year: 2025,
    };
    let batch = service
        .create_batch_from_guides(&context(TestUser::billing(&clinic_id)), request, "user-token")
        .await
        .unwrap();

    assert_eq!(batch.batch_number, "202501001");
    assert_eq!(batch.status, BatchStatus::Draft);
}

struct ManualFixture {
    mock_server: MockServer,
    clinic_id: String,
    operator_id: String,
    batch_id: String,
    guide_ids: [String; 2],
}

impl ManualFixture {
    /// Two eligible guides of 150.00 and an empty period.
    async fn start() -> Self {
        let mock_server = MockServer::start().await;
        let clinic_id = Uuid::new_v4().to_string();
        let operator_id = Uuid::new_v4().to_string();
        let batch_id = Uuid::new_v4().to_string();
        let guide_ids = [Uuid::new_v4().to_string(), Uuid::new_v4().to_string()];

        Mock::given(method("GET"))
            .and(path("/rest/v1/insurance_companies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                MockSupabaseResponses::operator_response(&operator_id, &clinic_id)
            ])))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/tiss_batches"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/rest/v1/tiss_guides"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                MockSupabaseResponses::guide_response(&guide_ids[0], &clinic_id, &operator_id, None, "2025000001", "150.00"),
                MockSupabaseResponses::guide_response(&guide_ids[1], &clinic_id, &operator_id, None, "2025000002", "150.00")
            ])))
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/rest/v1/tiss_batches"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                MockSupabaseResponses::batch_response(&batch_id, &clinic_id, &operator_id, "draft")
            ])))
            .mount(&mock_server)
            .await;

        Self { mock_server, clinic_id, operator_id, batch_id, guide_ids }
    }

    async fn mount_guide_claim(&self, guide_id: &str, response: ResponseTemplate) {
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/tiss_guides"))
            .and(query_param("id", format!("eq.{}", guide_id)))
            .respond_with(response)
            .mount(&self.mock_server)
            .await;
    }

    async fn create(&self) -> Result<tiss_cell::models::TissBatch, TissError> {
        let config = TestConfig::with_mock_server(&self.mock_server.uri()).to_app_config();
        let request = CreateBatchRequest {
            operator_id: Uuid::parse_str(&self.operator_id).unwrap(),
            reference_month: 1,
            reference_year: 2025,
        };
        BatchService::new(&config)
            .create_batch_from_guides(&context(TestUser::billing(&self.clinic_id)), request, "user-token")
            .await
    }
}

#[tokio::test]
async fn test_create_batch_counts_only_claimed_guides() {
    let fixture = ManualFixture::start().await;

    fixture
        .mount_guide_claim(
            &fixture.guide_ids[0],
            ResponseTemplate::new(200).set_body_json(json!([{ "id": fixture.guide_ids[0] }])),
        )
        .await;
    // Batched by a concurrent request in the meantime
    fixture
        .mount_guide_claim(&fixture.guide_ids[1], ResponseTemplate::new(200).set_body_json(json!([])))
        .await;

    let mut corrected = MockSupabaseResponses::batch_response(
        &fixture.batch_id, &fixture.clinic_id, &fixture.operator_id, "draft"
    );
    corrected["total_guides"] = json!(1);
    corrected["total_value"] = json!("150.00");

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/tiss_batches"))
        .and(query_param("id", format!("eq.{}", fixture.batch_id)))
        .and(body_partial_json(json!({ "total_guides": 1, "total_value": "150.00" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([corrected])))
        .expect(1)
        .mount(&fixture.mock_server)
        .await;

    let batch = fixture.create().await.unwrap();

    assert_eq!(batch.total_guides, 1);
    assert_eq!(batch.total_value.to_string(), "150.00");
}

#[tokio::test]
async fn test_create_batch_with_no_claimable_guides_is_invalidated() {
    let fixture = ManualFixture::start().await;

    for guide_id in &fixture.guide_ids {
        fixture
            .mount_guide_claim(guide_id, ResponseTemplate::new(200).set_body_json(json!([])))
            .await;
    }

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/tiss_batches"))
        .and(query_param("status", "eq.draft"))
        .and(body_partial_json(json!({ "status": "invalid" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::batch_response(&fixture.batch_id, &fixture.clinic_id, &fixture.operator_id, "invalid")
        ])))
        .expect(1)
        .mount(&fixture.mock_server)
        .await;

    assert_matches!(fixture.create().await, Err(TissError::Conflict(_)));
}

#[tokio::test]
async fn test_create_batch_failure_midway_invalidates_batch() {
    let fixture = ManualFixture::start().await;

    fixture
        .mount_guide_claim(
            &fixture.guide_ids[0],
            ResponseTemplate::new(200).set_body_json(json!([{ "id": fixture.guide_ids[0] }])),
        )
        .await;
    fixture
        .mount_guide_claim(&fixture.guide_ids[1], ResponseTemplate::new(500).set_body_string("connection reset"))
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/tiss_batches"))
        .and(query_param("status", "eq.draft"))
        .and(body_partial_json(json!({ "status": "invalid" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::batch_response(&fixture.batch_id, &fixture.clinic_id, &fixture.operator_id, "invalid")
        ])))
        .expect(1)
        .mount(&fixture.mock_server)
        .await;

    assert!(fixture.create().await.is_err());
}

#[tokio::test]
async fn test_create_batch_without_eligible_guides() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&mock_server.uri()).to_app_config();

    let clinic_id = Uuid::new_v4().to_string();
    let operator_id = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/insurance_companies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::operator_response(&operator_id, &clinic_id)
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_batches"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_guides"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&mock_server)
        .await;

    let service = BatchService::new(&config);
    let request = CreateBatchRequest {
        operator_id: Uuid::parse_str(&operator_id).unwrap(),
        reference_month: 1,
        reference_year: 2025,
    };
    let result = service
        .create_batch_from_guides(&context(TestUser::billing(&clinic_id)), request, "user-token")
        .await;

    assert_matches!(result, Err(TissError::InvalidBatch(_)));
}

#[tokio::test]
async fn test_create_batch_for_foreign_insurer_is_forbidden() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&mock_server.uri()).to_app_config();

    let operator_id = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/insurance_companies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::operator_response(&operator_id, &Uuid::new_v4().to_string())
        ])))
        .mount(&mock_server)
        .await;

    let service = BatchService::new(&config);
    let request = CreateBatchRequest {
        operator_id: Uuid::parse_str(&operator_id).unwrap(),
        reference_month: 1,
        reference_year: 2025,
    };
    let caller = context(TestUser::clinic_admin(&Uuid::new_v4().to_string()));
    let result = service.create_batch_from_guides(&caller, request, "user-token").await;

    assert_matches!(result, Err(TissError::Forbidden(_)));
}

#[tokio::test]
async fn test_submit_requires_generated_xml() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&mock_server.uri()).to_app_config();

    let clinic_id = Uuid::new_v4().to_string();
    let batch_id = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_batches"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::batch_response(&batch_id, &clinic_id, &Uuid::new_v4().to_string(), "valid")
        ])))
        .mount(&mock_server)
        .await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/tiss_batches"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let service = BatchService::new(&config);
    let result = service
        .submit_batch(
            &context(TestUser::billing(&clinic_id)),
            Uuid::parse_str(&batch_id).unwrap(),
            "user-token",
        )
        .await;

    assert_matches!(result, Err(TissError::InvalidBatch(_)));
}

#[tokio::test]
async fn test_submit_draft_batch_is_rejected() {
    let mock_server = MockServer::start().await;
    let config = TestConfig::with_mock_server(&mock_server.uri()).to_app_config();

    let clinic_id = Uuid::new_v4().to_string();
    let batch_id = Uuid::new_v4().to_string();

    Mock::given(method("GET"))
        .and(path("/rest/v1/tiss_batches"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            MockSupabaseResponses::batch_response(&batch_id, &clinic_id, &Uuid::new_v4().to_string(), "draft")
        ])))
        .mount(&mock_server)
        .await;

    let service = BatchService::new(&config);
    let result = service
        .submit_batch(
            &context(TestUser::billing(&clinic_id)),
            Uuid::parse_str(&batch_id).unwrap(),
            "user-token",
        )
        .await;

    assert_matches!(
        result,
        Err(TissError::InvalidStatusTransition { from: BatchStatus::Draft, to: BatchStatus::Submitted })
    );
}
