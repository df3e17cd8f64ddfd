/// Runtime settings sourced from the environment. `dotenvy` is loaded in
/// `main` before any of these are read.
#[derive(Debug, Clone)]
pub struct Settings {
    pub app_name: String,
    pub api_prefix: String,
    pub allowed_origins: Vec<String>,
    pub model_base_url: String,
    pub model_api_key: String,
    pub model_name: String,
    pub reservation_hold_minutes: i64,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("HOLDLINE_APP_NAME", "holdline"),
            api_prefix: env_or("HOLDLINE_API_PREFIX", "/api"),
            allowed_origins: split_origins(&env_or(
                "HOLDLINE_ALLOWED_ORIGINS",
                "http://localhost:5173",
            )),
            model_base_url: env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            model_api_key: env_or("OPENAI_API_KEY", ""),
            model_name: env_or("HOLDLINE_MODEL", "gpt-4o-mini"),
            reservation_hold_minutes: env_or("RESERVATION_HOLD_MINUTES", "10")
                .parse()
                .unwrap_or(10),
        }
    }

    pub fn has_model_credentials(&self) -> bool {
        !self.model_api_key.is_empty()
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_split_and_trim() {
        let origins = split_origins(" http://a:3000, http://b:5173 ,, ");
        assert_eq!(origins, vec!["http://a:3000", "http://b:5173"]);
    }

    #[test]
    fn empty_origin_list_is_empty() {
        assert!(split_origins("").is_empty());
    }
}
