//! Environment-derived client configuration (spec.md §6).

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub api_key: String,
    pub project_id: String,
    pub deployment_id: String,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, String> {
        Ok(Self {
            api_url: std::env::var("POLOS_API_URL")
                .map_err(|_| "POLOS_API_URL environment variable not set".to_string())?,
            api_key: std::env::var("POLOS_API_KEY")
                .map_err(|_| "POLOS_API_KEY environment variable not set".to_string())?,
            project_id: std::env::var("POLOS_PROJECT_ID")
                .map_err(|_| "POLOS_PROJECT_ID environment variable not set".to_string())?,
            deployment_id: std::env::var("POLOS_DEPLOYMENT_ID")
                .map_err(|_| "POLOS_DEPLOYMENT_ID environment variable not set".to_string())?,
        })
    }
}
