//! Environment-driven server configuration.
//!
//! All provider credentials are read once at startup and are read-only
//! afterwards. A missing provider key is not fatal here; it fails the
//! individual voice session that needs it.

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// Deployment environment: `development` or `production`.
    pub env: String,
    /// SQLite database path.
    pub db_path: String,

    /// Speech-to-text provider token.
    pub assemblyai_key: String,
    /// Text-to-speech provider key.
    pub cartesia_key: String,
    /// Fallback voice id used when an agent has none configured.
    pub cartesia_voice: String,

    /// Direct-LLM provider keys.
    pub anthropic_key: String,
    pub openai_key: String,

    /// Tool-agent microservice base URL.
    pub tool_agent_url: String,
    /// Whether to attempt tool-agent sessions (falls back to direct LLM).
    pub tool_agent_enabled: bool,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            port: env_or("PORT", "8080").parse().unwrap_or(8080),
            env: env_or("ENV", "development"),
            db_path: env_or("VOICELINE_DB", "voiceline.db"),
            assemblyai_key: env_or("ASSEMBLYAI_API_KEY", ""),
            cartesia_key: env_or("CARTESIA_API_KEY", ""),
            cartesia_voice: env_or(
                "CARTESIA_VOICE_ID",
                "a0e99841-438c-4a64-b679-ae501e7d6091",
            ),
            anthropic_key: env_or("ANTHROPIC_API_KEY", ""),
            openai_key: env_or("OPENAI_API_KEY", ""),
            tool_agent_url: env_or("TOOL_AGENT_URL", "http://localhost:8081"),
            tool_agent_enabled: env_or("TOOL_AGENT_ENABLED", "true") == "true",
        }
    }

    pub fn is_development(&self) -> bool {
        self.env == "development"
    }

    pub fn is_production(&self) -> bool {
        self.env == "production"
    }
}

fn env_or(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_returns_default_for_missing() {
        assert_eq!(env_or("VOICELINE_TEST_UNSET_VAR", "fallback"), "fallback");
    }

    #[test]
    fn env_or_reads_set_var() {
        std::env::set_var("VOICELINE_TEST_SET_VAR", "value");
        assert_eq!(env_or("VOICELINE_TEST_SET_VAR", "fallback"), "value");
        std::env::remove_var("VOICELINE_TEST_SET_VAR");
    }

    #[test]
    fn environment_helpers() {
        let mut config = Config::from_env();
        config.env = "development".to_string();
        assert!(config.is_development());
        assert!(!config.is_production());

        config.env = "production".to_string();
        assert!(config.is_production());
        assert!(!config.is_development());
    }
}
