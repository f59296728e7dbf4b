//! Carga y gestión de configuración de la aplicación (servidor + contexto).

use std::{env, time::Duration};
use anyhow::{anyhow, Result};

use crate::context::DEFAULT_TOKEN_LIMIT;

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_SESSION_SWEEP: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(anyhow!("Entorno no soportado: {other}")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    /// Origen permitido para CORS; `*` acepta cualquiera.
    pub frontend_url: String,
    pub environment: Environment,
    pub default_token_limit: u64,
    /// Inactividad tras la cual una sesión se descarta.
    pub session_ttl: Duration,
    pub session_sweep_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:3001".to_string(),
            frontend_url: "http://localhost:3000".to_string(),
            environment: Environment::Development,
            default_token_limit: DEFAULT_TOKEN_LIMIT,
            session_ttl: DEFAULT_SESSION_TTL,
            session_sweep_interval: DEFAULT_SESSION_SWEEP,
        }
    }
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let server_addr = match (get("SERVER_ADDR"), get("PORT")) {
            (Some(addr), _) => addr,
            (None, Some(port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| anyhow!("PORT no es un puerto válido: {port}"))?;
                format!("127.0.0.1:{port}")
            }
            (None, None) => defaults.server_addr,
        };

        let frontend_url = get("FRONTEND_URL").unwrap_or(defaults.frontend_url);

        let environment = match get("APP_ENV") {
            Some(value) => Environment::from_str(&value)?,
            None => defaults.environment,
        };

        let default_token_limit = match get("DEFAULT_TOKEN_LIMIT") {
            Some(value) => {
                let limit: u64 = value
                    .parse()
                    .map_err(|_| anyhow!("DEFAULT_TOKEN_LIMIT no es un entero: {value}"))?;
                if limit == 0 {
                    return Err(anyhow!("DEFAULT_TOKEN_LIMIT debe ser mayor que cero"));
                }
                limit
            }
            None => defaults.default_token_limit,
        };

        let session_ttl = secs_var(&get, "SESSION_TTL_SECS")?.unwrap_or(defaults.session_ttl);
        let session_sweep_interval =
            secs_var(&get, "SESSION_SWEEP_SECS")?.unwrap_or(defaults.session_sweep_interval);

        Ok(Self {
            server_addr,
            frontend_url,
            environment,
            default_token_limit,
            session_ttl,
            session_sweep_interval,
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}

/// Duración en segundos, mayor que cero.
fn secs_var(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    let Some(value) = get(key) else {
        return Ok(None);
    };
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Some(Duration::from_secs(secs))),
        _ => Err(anyhow!("{key} debe ser un número de segundos mayor que cero: {value}")),
    }
}
