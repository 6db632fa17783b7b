//! Loads the INI-like `container.conf` file described in spec.md §6.
//!
//! The format is Python-`configparser`-shaped: values set in `[DEFAULT]`
//! are visible as fallbacks inside every `[group]` section, which is why
//! we lean on the `configparser` crate instead of a plain `ini` reader.

use std::path::PathBuf;

use configparser::ini::Ini;
use tracing::Level;

use crate::error::ConfigError;

/// `log_level` values accepted in `[DEFAULT]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
    }

    /// `tracing` has no CRITICAL level; it collapses onto ERROR.
    pub fn as_tracing_level(self) -> Level {
        match self {
            Self::Debug => Level::DEBUG,
            Self::Info => Level::INFO,
            Self::Warning => Level::WARN,
            Self::Error | Self::Critical => Level::ERROR,
        }
    }
}

/// `verify = true|false|<path-to-ca-bundle>` in `[DEFAULT]`. Controls TLS
/// peer verification for the WebDAV/frontend clients, mirroring the
/// `verify=` argument threaded through every `requests.*` call in the
/// original implementation.
#[derive(Debug, Clone)]
pub enum TlsVerify {
    On,
    Off,
    CaBundle(PathBuf),
}

impl TlsVerify {
    fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "true" | "1" | "yes" => Self::On,
            "false" | "0" | "no" => Self::Off,
            other => Self::CaBundle(PathBuf::from(other)),
        }
    }
}

/// `[DEFAULT]` section, shared by all three binaries. Not every binary
/// reads every field (e.g. `pack` never reads `macaroon`), but all fields
/// are validated up front so a bad config file fails fast at startup.
#[derive(Debug, Clone)]
pub struct DefaultConfig {
    pub script_id: String,
    pub mongo_url: String,
    pub mongo_db: String,
    pub working_dir: PathBuf,
    pub loop_delay_secs: u64,
    pub log_level: LogLevel,
    pub tls_verify: TlsVerify,
    pub macaroon_path: Option<PathBuf>,
    pub webdav_door: Option<String>,
    pub frontend: Option<String>,
    pub driver_url: Option<String>,
    pub mount_point: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    pub keep_archive_time_min: u64,
    pub stage_wait_min_secs: f64,
    pub stage_wait_max_secs: f64,
}

/// A `[group]` section.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub name: String,
    pub path_expression: String,
    pub file_expression: String,
    pub s_group: String,
    pub store_name: String,
    pub archive_size_bytes: u64,
    pub min_age_min: u64,
    pub max_age_min: u64,
    pub verify: VerifyMode,
    pub archive_path: String,
    pub quota: i64,
}

/// Container sealing verification strategy (spec.md §4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    FileList,
    /// Declared but unimplemented upstream; behaves like `FileList` and
    /// logs a warning the first time it's used (spec.md §9).
    Chksum,
    Off,
}

impl VerifyMode {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_lowercase().as_str() {
            "filelist" => Ok(Self::FileList),
            "chksum" => Ok(Self::Chksum),
            "off" => Ok(Self::Off),
            other => Err(ConfigError::InvalidVerifyMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub default: DefaultConfig,
    pub groups: Vec<GroupConfig>,
}

/// Parses an `archive_size` value like `1G`, `500M`, `100K` into bytes.
/// Suffixes are decimal (×10³/10⁶/10⁹), matching the original
/// `.replace('G', '000000000')` string surgery.
pub fn parse_size(s: &str) -> Result<u64, ConfigError> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some('G') | Some('g') => (&s[..s.len() - 1], 1_000_000_000u64),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1_000_000u64),
        Some('K') | Some('k') => (&s[..s.len() - 1], 1_000u64),
        _ => (s, 1u64),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidSize(s.to_string()))?;
    Ok(n * multiplier)
}

fn require(ini: &Ini, section: &str, key: &str) -> Result<String, ConfigError> {
    ini.get(section, key)
        .ok_or_else(|| ConfigError::MissingOption(section.to_string(), key.to_string()))
}

fn optional(ini: &Ini, section: &str, key: &str) -> Option<String> {
    ini.get(section, key)
}

fn validate_script_id(script_id: &str) -> Result<(), ConfigError> {
    if script_id.chars().any(|c| c == '/' || c == '$' || c == '\0') {
        return Err(ConfigError::InvalidScriptId(script_id.to_string()));
    }
    Ok(())
}

fn validate_mongo_db(name: &str) -> Result<(), ConfigError> {
    if name.contains('.') {
        return Err(ConfigError::InvalidMongoDb(name.to_string()));
    }
    Ok(())
}

impl Config {
    /// Loads and fully validates a config file. Any error here is a
    /// Validation-class error: fatal at startup, exit code 1.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;

        let script_id = require(&ini, "default", "script_id")?;
        validate_script_id(&script_id)?;
        let mongo_url = require(&ini, "default", "mongo_url")?;
        let mongo_db = require(&ini, "default", "mongo_db")?;
        validate_mongo_db(&mongo_db)?;
        let working_dir = PathBuf::from(require(&ini, "default", "working_dir")?);
        let loop_delay_secs: u64 = require(&ini, "default", "loop_delay")?
            .parse()
            .map_err(|_| ConfigError::InvalidNumber("loop_delay".into()))?;
        let log_level = LogLevel::parse(&require(&ini, "default", "log_level")?)?;
        let tls_verify = optional(&ini, "default", "verify")
            .map(|v| TlsVerify::parse(&v))
            .unwrap_or(TlsVerify::On);
        let macaroon_path = optional(&ini, "default", "macaroon").map(PathBuf::from);
        let webdav_door = optional(&ini, "default", "webdav_door");
        let frontend = optional(&ini, "default", "frontend");
        let driver_url = optional(&ini, "default", "driver_url");
        let mount_point = optional(&ini, "default", "mount_point").map(PathBuf::from);
        let data_root = optional(&ini, "default", "data_root").map(PathBuf::from);
        let keep_archive_time_min: u64 = optional(&ini, "default", "keep_archive_time")
            .unwrap_or_else(|| "60".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidNumber("keep_archive_time".into()))?;
        let stage_wait_min_secs: f64 = optional(&ini, "default", "stage_wait_min")
            .unwrap_or_else(|| "0".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidNumber("stage_wait_min".into()))?;
        let stage_wait_max_secs: f64 = optional(&ini, "default", "stage_wait_max")
            .unwrap_or_else(|| "0".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidNumber("stage_wait_max".into()))?;
        if stage_wait_min_secs > stage_wait_max_secs && stage_wait_max_secs > 0.0 {
            return Err(ConfigError::StageWaitOrder);
        }

        let default = DefaultConfig {
            script_id,
            mongo_url,
            mongo_db,
            working_dir,
            loop_delay_secs,
            log_level,
            tls_verify,
            macaroon_path,
            webdav_door,
            frontend,
            driver_url,
            mount_point,
            data_root,
            keep_archive_time_min,
            stage_wait_min_secs,
            stage_wait_max_secs,
        };

        let mut groups = Vec::new();
        for section in ini.sections() {
            if section.eq_ignore_ascii_case("default") {
                continue;
            }
            groups.push(Self::load_group(&ini, &section)?);
        }

        Ok(Self { default, groups })
    }

    fn load_group(ini: &Ini, name: &str) -> Result<GroupConfig, ConfigError> {
        let path_expression = require(ini, name, "path_expression")?;
        regex::Regex::new(&path_expression)
            .map_err(|e| ConfigError::InvalidRegex(name.to_string(), e.to_string()))?;
        let file_expression = require(ini, name, "file_expression")?;
        regex::Regex::new(&file_expression)
            .map_err(|e| ConfigError::InvalidRegex(name.to_string(), e.to_string()))?;
        let s_group = require(ini, name, "s_group")?;
        let store_name = require(ini, name, "store_name")?;
        let archive_size_bytes = parse_size(&require(ini, name, "archive_size")?)?;
        let min_age_min: u64 = require(ini, name, "min_age")?
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(format!("{name}.min_age")))?;
        let max_age_min: u64 = require(ini, name, "max_age")?
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(format!("{name}.max_age")))?;
        let verify = VerifyMode::parse(&require(ini, name, "verify")?)?;
        let archive_path = require(ini, name, "archive_path")?;
        let quota: i64 = optional(ini, name, "quota")
            .unwrap_or_else(|| "-1".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(format!("{name}.quota")))?;

        Ok(GroupConfig {
            name: name.to_string(),
            path_expression,
            file_expression,
            s_group,
            store_name,
            archive_size_bytes,
            min_age_min,
            max_age_min,
            verify,
            archive_path,
            quota,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_conf(body: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_size_suffixes() {
        assert_eq!(parse_size("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("500M").unwrap(), 500_000_000);
        assert_eq!(parse_size("100K").unwrap(), 100_000);
        assert_eq!(parse_size("42").unwrap(), 42);
    }

    #[test]
    fn rejects_bad_script_id() {
        assert!(validate_script_id("pack/1").is_err());
        assert!(validate_script_id("pack$1").is_err());
        assert!(validate_script_id("pack-1").is_ok());
    }

    #[test]
    fn group_inherits_default_section() {
        // `s_group` is set only in [DEFAULT] and should be visible in
        // [groupA] without repeating it there.
        let f = write_conf(
            "[DEFAULT]\n\
             script_id = pack1\n\
             mongo_url = mongodb://localhost:27017/\n\
             mongo_db = smallfiles\n\
             working_dir = /tmp/work\n\
             loop_delay = 5\n\
             log_level = INFO\n\
             s_group = shared-group\n\
             [groupA]\n\
             path_expression = ^/data/a\n\
             file_expression = .*\n\
             store_name = store\n\
             archive_size = 1G\n\
             min_age = 0\n\
             max_age = 999999\n\
             verify = filelist\n\
             archive_path = /archives/a\n",
        );
        let config = Config::load(f.path()).unwrap();
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].s_group, "shared-group");
        assert_eq!(config.groups[0].verify, VerifyMode::FileList);
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Config::load(std::path::Path::new("/nonexistent/container.conf"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }
}
