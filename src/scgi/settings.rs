//! Server limits and timeouts.
//!
//! A `Settings` value is built once before the server starts and is then
//! shared read-only by every connection worker.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings
{
    /// Largest accepted header block, in bytes.
    /// 42 KiB = (max 4 KiB/cookie) * (max 10 cookies) + 2 KiB of headers
    pub max_header_size: usize,
    /// Largest accepted request body, in bytes
    pub max_content_size: usize,
    /// How long a single accept may block before the loop re-checks
    /// for shutdown
    #[serde(rename = "listen_accept_timeout_ms", with = "millis")]
    pub listen_accept_timeout: Duration,
    /// Deadline for each individual read from a connection
    #[serde(rename = "read_timeout_ms", with = "millis")]
    pub read_timeout: Duration,
    /// Deadline for writing the response head, and again for the body
    #[serde(rename = "write_timeout_ms", with = "millis")]
    pub write_timeout: Duration,
    /// Stop accepting on Ctrl-C as well as on an explicit close
    pub catch_interrupt: bool,
}

impl Default for Settings
{
    fn default() -> Settings
    {
        Settings{
            max_header_size: 42 * 1024,
            max_content_size: 4 * 1024 * 1024,
            listen_accept_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            catch_interrupt: true
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError
{
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0} must be greater than zero")]
    Invalid(&'static str),
}

impl Settings
{
    pub fn new() -> Settings
    {
        Settings::default()
    }

    /// Parse settings from TOML text. Missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Settings, ConfigError>
    {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Settings, ConfigError>
    {
        let text = fs::read_to_string(path)?;
        Settings::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError>
    {
        if self.max_header_size == 0 {
            return Err(ConfigError::Invalid("max_header_size"));
        }
        if self.max_content_size == 0 {
            return Err(ConfigError::Invalid("max_content_size"));
        }
        if self.listen_accept_timeout.is_zero() {
            return Err(ConfigError::Invalid("listen_accept_timeout_ms"));
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::Invalid("read_timeout_ms"));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::Invalid("write_timeout_ms"));
        }
        Ok(())
    }
}

mod millis
{
    use serde::{Deserialize, Deserializer, Serializer};
    use std::convert::TryFrom;
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
        where S: Serializer
    {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
        where D: Deserializer<'de>
    {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[test]
fn test_default_settings()
{
    let s = Settings::new();
    assert_eq!(s.max_header_size, 43008);
    assert_eq!(s.max_content_size, 4194304);
    assert_eq!(s.listen_accept_timeout, Duration::from_secs(3));
    assert_eq!(s.read_timeout, Duration::from_secs(5));
    assert_eq!(s.write_timeout, Duration::from_secs(5));
    assert!(s.validate().is_ok());
}

#[test]
fn test_settings_from_toml()
{
    let s = Settings::from_toml("max_content_size = 1024\n\
                                 read_timeout_ms = 250\n\
                                 catch_interrupt = false\n").unwrap();
    assert_eq!(s.max_content_size, 1024);
    assert_eq!(s.read_timeout, Duration::from_millis(250));
    assert!(!s.catch_interrupt);
    // untouched keys keep their defaults
    assert_eq!(s.max_header_size, 42 * 1024);
    assert_eq!(s.write_timeout, Duration::from_secs(5));
}

#[test]
fn test_settings_reject_zero()
{
    match Settings::from_toml("write_timeout_ms = 0") {
        Err(ConfigError::Invalid(name)) => assert_eq!(name, "write_timeout_ms"),
        other => panic!("unexpected {:?}", other)
    }
    match Settings::from_toml("max_header_size = 0") {
        Err(ConfigError::Invalid(name)) => assert_eq!(name, "max_header_size"),
        other => panic!("unexpected {:?}", other)
    }
    assert!(matches!(Settings::from_toml("max_header_size = \"big\""),
                     Err(ConfigError::Parse(_))));
}

#[test]
fn test_settings_load_file()
{
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "max_header_size = 512").unwrap();
    writeln!(file, "listen_accept_timeout_ms = 100").unwrap();
    let s = Settings::load(file.path()).unwrap();
    assert_eq!(s.max_header_size, 512);
    assert_eq!(s.listen_accept_timeout, Duration::from_millis(100));
    assert!(matches!(Settings::load(Path::new("/nonexistent/scgi.toml")),
                     Err(ConfigError::Io(_))));
}
