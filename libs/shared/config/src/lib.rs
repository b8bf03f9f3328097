use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub supabase_service_role_key: String,
    pub storage_bucket: String,
    pub mail_api_url: String,
    pub mail_api_key: String,
    pub mail_from: String,
    pub tiss_enabled_plans: Vec<String>,
    pub tiss_scheduler_enabled: bool,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_SERVICE_ROLE_KEY not set, scheduled batching will fail to authenticate");
                    String::new()
                }),
            storage_bucket: env::var("TISS_STORAGE_BUCKET")
                .unwrap_or_else(|_| "tiss-files".to_string()),
            mail_api_url: env::var("MAIL_API_URL")
                .unwrap_or_else(|_| {
                    warn!("MAIL_API_URL not set, batch notifications disabled");
                    String::new()
                }),
            mail_api_key: env::var("MAIL_API_KEY").unwrap_or_default(),
            mail_from: env::var("MAIL_FROM")
                .unwrap_or_else(|_| "faturamento@localhost".to_string()),
            tiss_enabled_plans: env::var("TISS_ENABLED_PLANS")
                .map(|raw| parse_list(&raw))
                .unwrap_or_else(|_| vec!["professional".to_string(), "enterprise".to_string()]),
            tiss_scheduler_enabled: env::var("TISS_SCHEDULER_ENABLED")
                .map(|raw| matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            port: env::var("PORT")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(3000),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    pub fn is_mail_configured(&self) -> bool {
        !self.mail_api_url.is_empty() && !self.mail_api_key.is_empty()
    }

    pub fn is_plan_tiss_enabled(&self, plan: &str) -> bool {
        self.tiss_enabled_plans
            .iter()
            .any(|enabled| enabled.eq_ignore_ascii_case(plan))
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}
