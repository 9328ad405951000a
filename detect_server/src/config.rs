use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub service: ServiceSettings,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub pipeline: PipelineSettings,
    pub engine: EngineSettings,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceSettings {
    pub host: String,
    pub port: u16,
}

impl ServiceSettings {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSettings {
    /// Device ordinals; one worker thread is bound to each entry.
    #[serde(default = "default_contexts")]
    pub contexts: Vec<u32>,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// `None` leaves the work queue unbounded.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub backpressure: Backpressure,
    #[serde(default = "default_backoff_threshold")]
    pub backoff_threshold: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            contexts: default_contexts(),
            batch_limit: default_batch_limit(),
            queue_capacity: default_queue_capacity(),
            backpressure: Backpressure::default(),
            backoff_threshold: default_backoff_threshold(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_contexts() -> Vec<u32> {
    vec![0]
}

fn default_batch_limit() -> usize {
    10
}

fn default_queue_capacity() -> Option<usize> {
    Some(256)
}

fn default_backoff_threshold() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    50
}

/// Producer behavior when the work queue is at capacity.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backpressure {
    #[default]
    Block,
    Reject,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    #[serde(default)]
    pub kind: EngineKind,
    #[serde(default = "default_classes")]
    pub classes: u32,
    #[serde(default = "default_detections_per_frame")]
    pub detections_per_frame: usize,
    #[serde(default)]
    pub latency_ms: u64,
}

fn default_classes() -> u32 {
    80
}

fn default_detections_per_frame() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Synthetic,
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = std::env::current_dir().expect("Failed to determine the current directory");
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENVIRONMENT");

    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(format!("{}.yaml", environment.as_str())),
        ))
        .add_source(
            config::Environment::with_prefix("DS")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let settings = settings.try_deserialize::<Settings>()?;
    if settings.pipeline.contexts.is_empty() {
        return Err(config::ConfigError::Message(
            "pipeline.contexts must name at least one execution context".into(),
        ));
    }
    if settings.pipeline.batch_limit == 0 {
        return Err(config::ConfigError::Message(
            "pipeline.batch_limit must be at least 1".into(),
        ));
    }

    Ok(settings)
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}
