use std::sync::Arc;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use base64::{Engine as _, engine::general_purpose};
use serde_json::json;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;

pub const TEST_JWT_SECRET: &str = "test-secret-key-for-jwt-validation-must-be-long-enough";

pub struct TestConfig {
    pub jwt_secret: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub mail_api_url: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            jwt_secret: TEST_JWT_SECRET.to_string(),
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            mail_api_url: String::new(),
        }
    }
}

impl TestConfig {
    /// Points both the store and the mail collaborator at the same mock server.
    pub fn with_mock_server(uri: &str) -> Self {
        Self {
            supabase_url: uri.to_string(),
            mail_api_url: uri.to_string(),
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            supabase_jwt_secret: self.jwt_secret.clone(),
            supabase_service_role_key: "test-service-role-key".to_string(),
            storage_bucket: "tiss-files".to_string(),
            mail_api_url: self.mail_api_url.clone(),
            mail_api_key: if self.mail_api_url.is_empty() { String::new() } else { "test-mail-key".to_string() },
            mail_from: "faturamento@clinica.test".to_string(),
            tiss_enabled_plans: vec!["professional".to_string(), "enterprise".to_string()],
            tiss_scheduler_enabled: false,
            port: 3000,
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct TestUser {
    pub id: String,
    pub email: String,
    pub role: String,
    pub clinic_id: String,
}

impl Default for TestUser {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: "test@example.com".to_string(),
            role: "billing".to_string(),
            clinic_id: Uuid::new_v4().to_string(),
        }
    }
}

impl TestUser {
    pub fn new(email: &str, role: &str, clinic_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            role: role.to_string(),
            clinic_id: clinic_id.to_string(),
        }
    }

    pub fn billing(clinic_id: &str) -> Self {
        Self::new("faturamento@clinica.test", "billing", clinic_id)
    }

    pub fn clinic_admin(clinic_id: &str) -> Self {
        Self::new("gestor@clinica.test", "clinic_admin", clinic_id)
    }

    pub fn admin(clinic_id: &str) -> Self {
        Self::new("admin@clinica.test", "admin", clinic_id)
    }

    pub fn receptionist(clinic_id: &str) -> Self {
        Self::new("recepcao@clinica.test", "receptionist", clinic_id)
    }

    pub fn app_metadata(&self) -> serde_json::Value {
        json!({
            "role": self.role,
            "clinic_id": self.clinic_id
        })
    }

    pub fn to_user(&self) -> User {
        User {
            id: self.id.clone(),
            email: Some(self.email.clone()),
            role: Some("authenticated".to_string()),
            metadata: None,
            app_metadata: Some(self.app_metadata()),
            created_at: Some(Utc::now()),
        }
    }
}

pub struct JwtTestUtils;

impl JwtTestUtils {
    pub fn create_test_token(user: &TestUser, secret: &str, exp_hours: Option<i64>) -> String {
        let now = Utc::now();
        let exp = now + Duration::hours(exp_hours.unwrap_or(24));

        let header = json!({
            "alg": "HS256",
            "typ": "JWT"
        });

        let payload = json!({
            "sub": user.id,
            "email": user.email,
            "role": "authenticated",
            "app_metadata": user.app_metadata(),
            "iat": now.timestamp(),
            "exp": exp.timestamp()
        });

        let header_encoded = general_purpose::URL_SAFE_NO_PAD.encode(header.to_string());
        let payload_encoded = general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string());

        let signing_input = format!("{}.{}", header_encoded, payload_encoded);

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_encoded = general_purpose::URL_SAFE_NO_PAD.encode(signature);

        format!("{}.{}", signing_input, signature_encoded)
    }

    pub fn create_expired_token(user: &TestUser, secret: &str) -> String {
        Self::create_test_token(user, secret, Some(-1))
    }

    pub fn create_invalid_signature_token(user: &TestUser) -> String {
        Self::create_test_token(user, "wrong-secret", Some(24))
    }
}

/// PostgREST-shaped rows for the TISS tables.
pub struct MockSupabaseResponses;

impl MockSupabaseResponses {
    pub fn clinic_response(clinic_id: &str, name: &str) -> serde_json::Value {
        json!({
            "id": clinic_id,
            "name": name,
            "cnpj": "12345678000190",
            "cnes": "1234567",
            "email": "admin@clinica.test",
            "subscription_plan": "professional"
        })
    }

    pub fn operator_response(operator_id: &str, clinic_id: &str) -> serde_json::Value {
        json!({
            "id": operator_id,
            "clinic_id": clinic_id,
            "name": "Saúde Total",
            "ans_code": "123456",
            "provider_code": "PRE-0042",
            "is_active": true
        })
    }

    pub fn patient_insurance_response(id: &str, patient_id: &str, operator_id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "patient_id": patient_id,
            "insurance_company_id": operator_id,
            "card_number": "0012345600001",
            "is_active": true
        })
    }

    pub fn batch_response(batch_id: &str, clinic_id: &str, operator_id: &str, status: &str) -> serde_json::Value {
        json!({
            "id": batch_id,
            "clinic_id": clinic_id,
            "insurance_company_id": operator_id,
            "batch_number": "202501001",
            "reference_month": 1,
            "reference_year": 2025,
            "total_guides": 2,
            "total_value": "300.00",
            "status": status,
            "xml_file_url": null,
            "xml_file_size": null,
            "xml_generated_at": null,
            "submitted_at": null,
            "created_at": "2025-02-01T03:00:00Z",
            "updated_at": "2025-02-01T03:00:00Z"
        })
    }

    pub fn guide_response(
        guide_id: &str,
        clinic_id: &str,
        operator_id: &str,
        batch_id: Option<&str>,
        guide_number: &str,
        total_value: &str,
    ) -> serde_json::Value {
        json!({
            "id": guide_id,
            "guide_number": guide_number,
            "guide_type": "consultation",
            "clinic_id": clinic_id,
            "operator_id": operator_id,
            "patient_id": Uuid::new_v4(),
            "patient_insurance_id": Uuid::new_v4(),
            "doctor_id": null,
            "appointment_id": null,
            "batch_id": batch_id,
            "cid_primary": "J06.9",
            "cid_secondary": [],
            "authorization_number": null,
            "execution_date": "2025-01-15",
            "total_value": total_value,
            "status": "pending",
            "glosa_value": null,
            "observation": null,
            "processed_at": null,
            "created_at": "2025-01-15T12:00:00Z",
            "updated_at": "2025-01-15T12:00:00Z",
            "procedures": [{
                "id": Uuid::new_v4(),
                "guide_id": guide_id,
                "procedure_code": "10101012",
                "description": "Consulta em consultório",
                "quantity": 1,
                "unit_price": total_value,
                "reduction_factor": "1",
                "total_price": total_value
            }],
            "patient": { "full_name": "Maria da Silva", "cpf": "12345678909" },
            "patient_insurance": { "card_number": "0012345600001" }
        })
    }

    pub fn error_response(message: &str, code: &str) -> serde_json::Value {
        json!({
            "message": message,
            "code": code
        })
    }
}
