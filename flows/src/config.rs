use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tokio::fs;

use crate::error::FlowError;
use crate::error::FlowResult;
use crate::retry::BackoffPolicy;
use crate::sink::DumpMode;
use crate::sink::TableTarget;

pub const CONFIG_FILE_NAME: &str = "config.yaml";
const CONFIG_DIR_NAME: &str = ".pipelines";

pub const ENV_STATE_PATH: &str = "PIPELINES_STATE_PATH";
pub const ENV_OUTPUT_DIR: &str = "PIPELINES_OUTPUT_DIR";
pub const ENV_GCS_BUCKET: &str = "PIPELINES_GCS_BUCKET";
pub const ENV_MODE: &str = "PIPELINES_MODE";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Dev,
    Prod,
}

impl std::str::FromStr for RunMode {
    type Err = FlowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(RunMode::Dev),
            "prod" => Ok(RunMode::Prod),
            other => Err(FlowError::Config(format!(
                "unknown mode `{other}` (expected dev or prod)"
            ))),
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Dev => write!(f, "dev"),
            RunMode::Prod => write!(f, "prod"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowsConfig {
    pub mode: RunMode,
    pub state_path: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub gcs_bucket: Option<String>,
    pub gcp: GcpConfig,
    pub backoff: BackoffPolicy,
    pub tables_bindings: TablesBindingsConfig,
    pub auditlog: AuditLogConfig,
    pub metadata: MetadataConfig,
    pub flooding: FloodingConfig,
    pub healthcheck: HealthcheckConfig,
    #[serde(default)]
    pub mapa_realizacoes: MapaRealizacoesConfig,

    #[serde(skip)]
    pub config_dir: PathBuf,
}

/// Endpoints and credentials for Google Cloud APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpConfig {
    /// Secret holding a base64 service account key. When unset, application
    /// default credentials are used.
    #[serde(default)]
    pub credentials_secret_name: Option<String>,
    pub asset_api_url: String,
    pub resource_manager_url: String,
    pub bigquery_url: String,
    pub logging_url: String,
    pub storage_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablesBindingsConfig {
    #[serde(flatten)]
    pub target: TableTarget,
    pub batch_size: usize,
    pub parallelism: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogConfig {
    #[serde(flatten)]
    pub target: TableTarget,
    pub last_execution_key: String,
    pub parallelism: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(flatten)]
    pub target: TableTarget,
    pub api_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloodingConfig {
    #[serde(flatten)]
    pub target: TableTarget,
    pub cameras_url: String,
    pub rain_api_url: String,
    pub rain_api_update_url: String,
    pub predictions_buffer_key: String,
    pub data_key: String,
    pub last_update_key: String,
    pub buffer_length: usize,
    pub mocked_cameras_number: usize,
    pub parallelism: usize,
    pub vision: VisionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionConfig {
    pub api_url: String,
    pub model: String,
    pub api_key_secret_name: String,
    pub prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    pub environment: String,
    pub min_messages_warning: u64,
    pub min_messages_critical: u64,
    pub discord_webhook_secret_name: String,
    pub data_relay: EnvironmentUrls,
    pub api: EnvironmentUrls,
}

/// Public works map: secret names, Firestore and geocoding endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapaRealizacoesConfig {
    pub infopref_url_secret_name: String,
    pub infopref_token_secret_name: String,
    pub gmaps_key_secret_name: String,
    pub firestore_credentials_secret_name: String,
    pub firestore_url: String,
    pub geocoding_url: String,
    pub parallelism: usize,
    /// Writes per Firestore commit.
    pub batch_limit: usize,
}

impl Default for MapaRealizacoesConfig {
    fn default() -> Self {
        Self {
            infopref_url_secret_name: "INFOPREF_URL".to_string(),
            infopref_token_secret_name: "INFOPREF_TOKEN".to_string(),
            gmaps_key_secret_name: "GMAPS_KEY".to_string(),
            firestore_credentials_secret_name: "FIRESTORE_CREDENTIALS".to_string(),
            firestore_url: "https://firestore.googleapis.com".to_string(),
            geocoding_url: "https://maps.googleapis.com".to_string(),
            parallelism: 50,
            batch_limit: crate::mapa_realizacoes::firestore::DEFAULT_BATCH_LIMIT,
        }
    }
}

/// Base URL of one service per deployment environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentUrls {
    pub staging: String,
    pub prod: String,
}

impl EnvironmentUrls {
    pub fn for_environment(&self, environment: &str) -> Option<&str> {
        match environment {
            "staging" => Some(&self.staging),
            "prod" => Some(&self.prod),
            _ => None,
        }
    }
}

const DEFAULT_FLOODING_PROMPT: &str = "You are an expert in urban flooding. Look at the street \
camera image and answer only with a JSON object of the form {\"flooding_detected\": true} or \
{\"flooding_detected\": false}. Flooding means water accumulated on the road surface that \
blocks or slows down traffic.";

impl FlowsConfig {
    /// Loads the configuration at `config_path`, or at the default location.
    ///
    /// A missing file yields the default configuration; nothing is written.
    pub async fn load(config_path: Option<&Path>) -> FlowResult<Self> {
        let (config_dir, config_file) = match config_path {
            Some(path) => (
                path.parent().map(Path::to_path_buf).unwrap_or_default(),
                path.to_path_buf(),
            ),
            None => {
                let dir = Self::default_config_dir()?;
                let file = dir.join(CONFIG_FILE_NAME);
                (dir, file)
            }
        };

        let mut config = if fs::try_exists(&config_file)
            .await
            .map_err(|err| FlowError::io(&config_file, err))?
        {
            let contents = fs::read_to_string(&config_file)
                .await
                .map_err(|err| FlowError::io(&config_file, err))?;
            let mut config: FlowsConfig = serde_yaml::from_str(&contents)?;
            config.config_dir = config_dir;
            config
        } else {
            Self::default_in(config_dir)
        };

        config.merge_env_vars()?;
        Ok(config)
    }

    pub fn default_config_dir() -> FlowResult<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| FlowError::Config("cannot determine home directory".to_string()))?;
        Ok(home.join(CONFIG_DIR_NAME))
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    pub async fn save(&self) -> FlowResult<()> {
        self.save_to(&self.config_file()).await
    }

    pub async fn save_to(&self, path: &Path) -> FlowResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| FlowError::io(parent, err))?;
        }
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)
            .await
            .map_err(|err| FlowError::io(path, err))?;
        Ok(())
    }

    /// Default configuration rooted at `config_dir`.
    pub fn default_in(config_dir: PathBuf) -> Self {
        Self {
            mode: RunMode::Dev,
            state_path: config_dir.join("state.db"),
            output_dir: config_dir.join("staging"),
            gcs_bucket: None,
            gcp: GcpConfig {
                credentials_secret_name: Some("LGPD_SERVICE_ACCOUNT_B64".to_string()),
                asset_api_url: "https://cloudasset.googleapis.com".to_string(),
                resource_manager_url: "https://cloudresourcemanager.googleapis.com".to_string(),
                bigquery_url: "https://bigquery.googleapis.com".to_string(),
                logging_url: "https://logging.googleapis.com".to_string(),
                storage_url: "https://storage.googleapis.com".to_string(),
            },
            backoff: BackoffPolicy::default(),
            tables_bindings: TablesBindingsConfig {
                target: TableTarget::new("datalake_gestao", "tables_bindings"),
                batch_size: crate::iam::MAX_NAMES_PER_BATCH,
                parallelism: 5,
            },
            auditlog: AuditLogConfig {
                target: TableTarget::new("datalake_gestao", "iam_audit_log"),
                last_execution_key: "lgpd_iam_audit_log_last_execution".to_string(),
                parallelism: 10,
            },
            metadata: MetadataConfig {
                target: TableTarget::new("datalake_gestao", "metadata"),
                api_url: "https://meta.dados.rio/api/projects".to_string(),
            },
            flooding: FloodingConfig {
                target: TableTarget::new("ai_vision_detection", "cameras_predicoes")
                    .with_dump_mode(DumpMode::Append),
                cameras_url: concat!(
                    "https://docs.google.com/spreadsheets/d/",
                    "122uOaPr8YdW5PTzrxSPF-FD0tgco596HqgB7WK7cHFw/export?format=csv&gid=914166579"
                )
                .to_string(),
                rain_api_url: "https://api.dados.rio/v2/clima_pluviometro/precipitacao_15min/"
                    .to_string(),
                rain_api_update_url: concat!(
                    "https://api.dados.rio/v2/clima_pluviometro/",
                    "ultima_atualizacao_precipitacao_15min/"
                )
                .to_string(),
                predictions_buffer_key: "flooding_detection_predictions_buffer".to_string(),
                data_key: "flooding_detection_data".to_string(),
                last_update_key: "flooding_detection_last_update".to_string(),
                buffer_length: crate::flooding::buffer::DEFAULT_BUFFER_LENGTH,
                mocked_cameras_number: 0,
                parallelism: 30,
                vision: VisionConfig {
                    api_url: "https://generativelanguage.googleapis.com".to_string(),
                    model: "gemini-pro-vision".to_string(),
                    api_key_secret_name: "GEMINI_PRO_VISION_API_KEY".to_string(),
                    prompt: DEFAULT_FLOODING_PROMPT.to_string(),
                    max_output_tokens: 300,
                    temperature: 0.4,
                    top_p: 1.0,
                    top_k: 32,
                },
            },
            healthcheck: HealthcheckConfig {
                environment: "prod".to_string(),
                min_messages_warning: 50,
                min_messages_critical: 100,
                discord_webhook_secret_name: "DISCORD_WEBHOOK_HEALTHCHECK_CIVITAS".to_string(),
                data_relay: EnvironmentUrls {
                    staging: "https://staging.data-relay.dados.rio".to_string(),
                    prod: "https://data-relay.dados.rio".to_string(),
                },
                api: EnvironmentUrls {
                    staging: "https://staging.api.civitas.rio".to_string(),
                    prod: "https://api.civitas.rio".to_string(),
                },
            },
            mapa_realizacoes: MapaRealizacoesConfig::default(),
            config_dir,
        }
    }

    pub fn merge_env_vars(&mut self) -> FlowResult<()> {
        self.merge_env(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`; empty values are ignored.
    pub fn merge_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> FlowResult<()> {
        let lookup = |name: &str| lookup(name).filter(|value| !value.is_empty());

        if let Some(path) = lookup(ENV_STATE_PATH) {
            self.state_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup(ENV_OUTPUT_DIR) {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(bucket) = lookup(ENV_GCS_BUCKET) {
            self.gcs_bucket = Some(bucket);
        }
        if let Some(mode) = lookup(ENV_MODE) {
            self.mode = mode.parse()?;
        }
        Ok(())
    }

    /// Human readable problems with the configuration; empty when usable.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.backoff.backoff_factor < 1.0 {
            issues.push(format!(
                "backoff.backoff_factor must be at least 1 (got {})",
                self.backoff.backoff_factor
            ));
        }
        let batch_size = self.tables_bindings.batch_size;
        if batch_size == 0 || batch_size > crate::iam::MAX_NAMES_PER_BATCH {
            issues.push(format!(
                "tables_bindings.batch_size must be between 1 and {} (got {batch_size})",
                crate::iam::MAX_NAMES_PER_BATCH
            ));
        }
        for (name, parallelism) in [
            ("tables_bindings", self.tables_bindings.parallelism),
            ("auditlog", self.auditlog.parallelism),
            ("flooding", self.flooding.parallelism),
            ("mapa_realizacoes", self.mapa_realizacoes.parallelism),
        ] {
            if parallelism == 0 {
                issues.push(format!("{name}.parallelism must be greater than zero"));
            }
        }
        for (name, target) in [
            ("tables_bindings", &self.tables_bindings.target),
            ("auditlog", &self.auditlog.target),
            ("metadata", &self.metadata.target),
            ("flooding", &self.flooding.target),
        ] {
            if target.dataset_id.is_empty() || target.table_id.is_empty() {
                issues.push(format!("{name} needs both dataset_id and table_id"));
            }
        }
        let batch_limit = self.mapa_realizacoes.batch_limit;
        let max_writes = crate::mapa_realizacoes::firestore::MAX_BATCH_WRITES;
        if batch_limit == 0 || batch_limit > max_writes {
            issues.push(format!(
                "mapa_realizacoes.batch_limit must be between 1 and {max_writes} \
                 (got {batch_limit})"
            ));
        }
        if self.flooding.buffer_length == 0 {
            issues.push("flooding.buffer_length must be greater than zero".to_string());
        }
        if self
            .healthcheck
            .data_relay
            .for_environment(&self.healthcheck.environment)
            .is_none()
        {
            issues.push(format!(
                "healthcheck.environment must be staging or prod (got `{}`)",
                self.healthcheck.environment
            ));
        }
        if self.healthcheck.min_messages_warning > self.healthcheck.min_messages_critical {
            issues.push(
                "healthcheck.min_messages_warning is above min_messages_critical".to_string(),
            );
        }
        if let Some(bucket) = &self.gcs_bucket
            && (bucket.starts_with("gs://") || bucket.contains('/'))
        {
            issues.push(format!(
                "gcs_bucket must be a bare bucket name (got `{bucket}`)"
            ));
        }

        issues
    }
}
