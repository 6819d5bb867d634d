use std::time::Duration;

use super::parsing::{
    env_optional, env_or_default, parse_ai_backend, parse_backoff_seconds, parse_bool,
    parse_concurrency, parse_environment, parse_lease_seconds, parse_poll_interval,
    parse_timeout_seconds, parse_u16, parse_u32, parse_u64, validate_ollama_url,
};
use super::types::{
    AiBackend, AiSettings, ConfigError, DatabaseSettings, RuntimeSettings, ServerHost, ServerPort,
    ServerSettings, Settings, StorageSettings, TelemetrySettings, WorkerSettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("WORKER_HTTP_HOST", "0.0.0.0");
        let port = env_or_default("WORKER_HTTP_PORT", "9100");

        let environment =
            parse_environment(env_optional("LEARNING_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("LEARNING_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "learning_worker");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "postgres");
        let database_url =
            env_optional("LEARNING_DATABASE_URL").or_else(|| env_optional("DATABASE_URL"));
        let run_migrations =
            env_optional("LEARNING_RUN_MIGRATIONS").map(|value| parse_bool(&value)).unwrap_or(true);

        let lease_seconds = parse_lease_seconds(env_or_default("WORKER_LEASE_SECONDS", "45"))?;
        let max_retries =
            parse_u32("WORKER_MAX_RETRIES", env_or_default("WORKER_MAX_RETRIES", "3"))?;
        let backoff_seconds = parse_backoff_seconds(env_optional("WORKER_BACKOFF_SECONDS"));
        let poll_interval = parse_poll_interval(
            "WORKER_POLL_INTERVAL",
            env_or_default("WORKER_POLL_INTERVAL", "0.5"),
        )?;
        let concurrency = parse_concurrency(env_optional("WORKER_CONCURRENCY"))?;

        let backend = parse_ai_backend(env_optional("AI_BACKEND"))?;
        let vision_model = env_or_default("AI_VISION_MODEL", "qwen2.5vl:3b");
        let feedback_model = env_or_default("AI_FEEDBACK_MODEL", "qwen2.5:3b-instruct");
        let timeout_vision_seconds =
            parse_timeout_seconds("AI_TIMEOUT_VISION", env_or_default("AI_TIMEOUT_VISION", "30"))?;
        let timeout_feedback_seconds = parse_timeout_seconds(
            "AI_TIMEOUT_FEEDBACK",
            env_or_default("AI_TIMEOUT_FEEDBACK", "15"),
        )?;
        let ollama_base_url = env_or_default("OLLAMA_BASE_URL", "http://ollama:11434");

        let storage_root = env_or_default("LEARNING_STORAGE_ROOT", "storage");
        let max_upload_bytes = parse_u64(
            "LEARNING_MAX_UPLOAD_BYTES",
            env_or_default("LEARNING_MAX_UPLOAD_BYTES", "10485760"),
        )?;

        let log_level = env_optional("LEARNING_LOG_LEVEL")
            .or_else(|| env_optional("LOG_LEVEL"))
            .unwrap_or_else(|| "info".to_string())
            .to_ascii_lowercase();
        let json = env_optional("LEARNING_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
                run_migrations,
            },
            worker: WorkerSettings {
                lease_seconds,
                max_retries,
                backoff_seconds,
                poll_interval,
                concurrency,
            },
            ai: AiSettings {
                backend,
                vision_model,
                feedback_model,
                timeout_vision_seconds,
                timeout_feedback_seconds,
                ollama_base_url,
            },
            storage: StorageSettings { root: storage_root, max_upload_bytes },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn worker(&self) -> &WorkerSettings {
        &self.worker
    }

    pub(crate) fn ai(&self) -> &AiSettings {
        &self.ai
    }

    pub(crate) fn storage(&self) -> &StorageSettings {
        &self.storage
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.max_upload_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "LEARNING_MAX_UPLOAD_BYTES",
                value: "0".to_string(),
            });
        }

        validate_ollama_url(&self.ai.ollama_base_url)?;

        if self.ai.backend == AiBackend::Stub && self.runtime.environment.is_prod_like() {
            return Err(ConfigError::StubBackendForbidden(self.runtime.environment.as_str()));
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }

        Ok(())
    }
}
