use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Which `TenantStore` implementation the binary wires up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbDriver {
    Sqlite,
    Memory,
}

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Console,
    Json,
}

/// Process-scoped configuration.
///
/// The core only reads it; bootstrap owns loading.
#[derive(Clone, Debug)]
pub struct Config {
    // Tenancy
    pub instance: String,

    // Persistence
    pub db_driver: DbDriver,
    pub db_path: PathBuf,

    // Tenant-scoped storage (attachments, history sync dumps)
    pub files_dir: PathBuf,

    // External queue
    pub redis_uri: Option<String>,
    pub redis_password: Option<String>,
    pub queue_name: String,

    // Webhook delivery
    pub webhook_timeout: Duration,
    pub webhook_max_redirects: usize,
    pub webhook_insecure_tls: bool,

    // Protocol engine bridge
    pub engine_bridge_path: PathBuf,
    pub engine_debug: Option<String>,

    // Logging
    pub log_format: LogFormat,

    // Runtime
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required: sessions and QR codes are scoped by instance.
        let instance = env_str("INSTANCE").and_then(non_empty).ok_or_else(|| {
            Error::Config("INSTANCE environment variable is required".to_string())
        })?;

        let db_driver = match env_str("DB_DRIVER")
            .unwrap_or_default()
            .trim()
            .to_lowercase()
            .as_str()
        {
            "" | "sqlite" => DbDriver::Sqlite,
            "memory" => DbDriver::Memory,
            other => {
                return Err(Error::Config(format!(
                    "unsupported DB_DRIVER: {other} (expected sqlite or memory)"
                )))
            }
        };
        let db_path = env_path("DB_PATH").unwrap_or_else(|| PathBuf::from("dbdata/users.db"));
        let files_dir = env_path("FILES_DIR").unwrap_or_else(|| PathBuf::from("files"));

        let redis_uri = env_str("REDIS_URI").and_then(non_empty);
        let redis_password = env_str("REDIS_PASS").and_then(non_empty);
        let queue_name = env_str("QUEUE_NAME")
            .and_then(non_empty)
            .or_else(|| env_str("DB_NAME").and_then(non_empty))
            .unwrap_or_else(|| instance.clone());

        let webhook_timeout =
            Duration::from_millis(env_u64("WEBHOOK_TIMEOUT_MS").unwrap_or(5_000));
        let webhook_max_redirects = env_usize("WEBHOOK_MAX_REDIRECTS").unwrap_or(15);
        let webhook_insecure_tls = env_bool("WEBHOOK_INSECURE_TLS").unwrap_or(false);

        let engine_bridge_path = env_path("ENGINE_BRIDGE_PATH")
            .or_else(|| which_in_path("hookgate-engine"))
            .unwrap_or_else(|| PathBuf::from("/usr/local/bin/hookgate-engine"));
        let engine_debug = env_str("ENGINE_DEBUG")
            .and_then(non_empty)
            .map(|s| s.trim().to_uppercase());

        let log_format = match env_str("LOG_FORMAT")
            .unwrap_or_default()
            .trim()
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Console,
        };

        let shutdown_grace = Duration::from_millis(env_u64("SHUTDOWN_GRACE_MS").unwrap_or(5_000));

        if db_driver == DbDriver::Sqlite {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        fs::create_dir_all(&files_dir)?;

        Ok(Self {
            instance,
            db_driver,
            db_path,
            files_dir,
            redis_uri,
            redis_password,
            queue_name,
            webhook_timeout,
            webhook_max_redirects,
            webhook_insecure_tls,
            engine_bridge_path,
            engine_debug,
            log_format,
            shutdown_grace,
        })
    }

    /// Redis list key consumed by the external Bull worker.
    pub fn queue_key(&self) -> String {
        format!("bull:bull:{}-Whatsmeow-Messages", self.queue_name)
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
