use std::{fs, path::Path, time::Duration};

const CONFIG_FILE: &str = "scenebot.toml";

const DEFAULT_REMOTE_HOST: &str = "127.0.0.1";
const DEFAULT_REMOTE_PORT: u16 = 9876;
const DEFAULT_EMBEDDING_DIM: usize = 384;
const DEFAULT_MAX_LOOPS: u32 = 10;
const DEFAULT_LLM_REPAIR_ATTEMPTS: u32 = 3;
const DEFAULT_CODE_EXEC_RETRIES: u32 = 3;
const DEFAULT_BREAKER_THRESHOLD: u32 = 3;
const DEFAULT_BREAKER_COOLDOWN_MS: u64 = 30_000;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Runtime configuration. Environment variables win over the optional
/// `scenebot.toml` next to the working directory; everything has a default
/// so a bare start against a local host works.
#[derive(Debug, Clone)]
pub struct Config {
    pub remote_host: String,
    pub remote_port: u16,
    pub db_connection: Option<String>,
    pub embedding_dim: usize,
    pub max_loops: u32,
    pub llm_repair_attempts: u32,
    pub code_exec_retries: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_host: DEFAULT_REMOTE_HOST.to_string(),
            remote_port: DEFAULT_REMOTE_PORT,
            db_connection: None,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            max_loops: DEFAULT_MAX_LOOPS,
            llm_repair_attempts: DEFAULT_LLM_REPAIR_ATTEMPTS,
            code_exec_retries: DEFAULT_CODE_EXEC_RETRIES,
            breaker_threshold: DEFAULT_BREAKER_THRESHOLD,
            breaker_cooldown: Duration::from_millis(DEFAULT_BREAKER_COOLDOWN_MS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    /// Load from the process environment plus `scenebot.toml` when present.
    /// Returns the config and any warnings worth showing at startup.
    pub fn load() -> (Self, Vec<String>) {
        let file = fs::read_to_string(Path::new(CONFIG_FILE)).ok();
        Self::from_sources(|key| std::env::var(key).ok(), file.as_deref())
    }

    pub fn from_sources(
        env: impl Fn(&str) -> Option<String>,
        file: Option<&str>,
    ) -> (Self, Vec<String>) {
        let mut warnings = Vec::new();
        let table = match file.map(|text| text.parse::<toml::Table>()) {
            Some(Ok(table)) => Some(table),
            Some(Err(e)) => {
                warnings.push(format!("{CONFIG_FILE} is invalid and was ignored: {e}"));
                None
            }
            None => None,
        };

        // env 优先，其次 toml，最后默认值
        let lookup = |key: &str| -> Option<String> {
            if let Some(v) = env(key) {
                if !v.trim().is_empty() {
                    return Some(v);
                }
            }
            table
                .as_ref()
                .and_then(|t| t.get(&key.to_ascii_lowercase()))
                .map(|v| match v {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
        };

        let mut cfg = Config::default();

        if let Some(host) = lookup("REMOTE_HOST") {
            cfg.remote_host = host;
        }
        parse_into(&lookup, "REMOTE_PORT", &mut cfg.remote_port, &mut warnings);
        cfg.db_connection = lookup("DB_CONNECTION");
        parse_into(&lookup, "EMBEDDING_DIM", &mut cfg.embedding_dim, &mut warnings);
        parse_into(&lookup, "MAX_LOOPS", &mut cfg.max_loops, &mut warnings);
        parse_into(
            &lookup,
            "LLM_REPAIR_ATTEMPTS",
            &mut cfg.llm_repair_attempts,
            &mut warnings,
        );
        parse_into(
            &lookup,
            "CODE_EXEC_RETRIES",
            &mut cfg.code_exec_retries,
            &mut warnings,
        );
        parse_into(
            &lookup,
            "CIRCUIT_BREAKER_THRESHOLD",
            &mut cfg.breaker_threshold,
            &mut warnings,
        );
        let mut cooldown_ms = cfg.breaker_cooldown.as_millis() as u64;
        parse_into(
            &lookup,
            "CIRCUIT_BREAKER_COOLDOWN_MS",
            &mut cooldown_ms,
            &mut warnings,
        );
        cfg.breaker_cooldown = Duration::from_millis(cooldown_ms);
        parse_into(&lookup, "REQUEST_QUEUE_CAPACITY", &mut cfg.queue_capacity, &mut warnings);

        if cfg.max_loops == 0 {
            warnings.push("MAX_LOOPS=0 would never run a step; using 1".to_string());
            cfg.max_loops = 1;
        }

        (cfg, warnings)
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
    warnings: &mut Vec<String>,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warnings.push(format!("{key}=`{raw}` is not a valid value; using default")),
        }
    }
}
