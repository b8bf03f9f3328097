use uuid::Uuid;

use shared_models::auth::User;

use crate::error::TissError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TissRole {
    Admin,
    ClinicAdmin,
    Billing,
}

impl TissRole {
    fn parse(raw: &str) -> Option<TissRole> {
        match raw {
            "admin" => Some(TissRole::Admin),
            "clinic_admin" => Some(TissRole::ClinicAdmin),
            "billing" => Some(TissRole::Billing),
            _ => None,
        }
    }
}

/// Caller identity for TISS operations, resolved from the JWT `app_metadata`.
#[derive(Debug, Clone)]
pub struct TissContext {
    pub user_id: String,
    pub clinic_id: Uuid,
    pub role: TissRole,
}

impl TissContext {
    pub fn from_user(user: &User) -> Result<Self, TissError> {
        let role = user
            .claim("role")
            .as_deref()
            .and_then(TissRole::parse)
            .ok_or_else(|| TissError::Forbidden("Perfil sem acesso ao faturamento TISS".to_string()))?;

        let clinic_id = user
            .claim("clinic_id")
            .and_then(|raw| Uuid::parse_str(&raw).ok())
            .ok_or_else(|| TissError::Forbidden("Usuário não vinculado a uma clínica".to_string()))?;

        Ok(Self {
            user_id: user.id.clone(),
            clinic_id,
            role,
        })
    }

    pub fn require_admin(&self) -> Result<(), TissError> {
        if self.role != TissRole::Admin {
            return Err(TissError::Forbidden("Operação restrita a administradores".to_string()));
        }
        Ok(())
    }

    pub fn ensure_clinic(&self, clinic_id: Uuid) -> Result<(), TissError> {
        if self.clinic_id != clinic_id {
            return Err(TissError::Forbidden("Registro pertence a outra clínica".to_string()));
        }
        Ok(())
    }
}
