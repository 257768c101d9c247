use std::time::Duration;

use thiserror::Error;

use crate::regs::{AvPackType, PowerOnReason};

#[cfg(unix)]
const DEFAULT_COM_PORT: &str = "/dev/ttyS0";
#[cfg(not(unix))]
const DEFAULT_COM_PORT: &str = "COM1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for env var {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Host-side settings of an SMC instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmcConfig {
    /// Serial port opened when the guest selects the named-port UART target.
    pub com_port: String,
    /// Host/port connected to when the guest selects the socket UART target.
    pub socket_addr: String,
    pub socket_port: u16,
    /// Time the tray spends in each intermediate state.
    pub tray_step: Duration,
    /// Clock interrupt period.
    pub clock_interval: Duration,
    pub power_on_reason: PowerOnReason,
    pub avpack: AvPackType,
}

impl Default for SmcConfig {
    fn default() -> Self {
        Self {
            com_port: DEFAULT_COM_PORT.to_owned(),
            socket_addr: "127.0.0.1".to_owned(),
            socket_port: 7000,
            tray_step: Duration::from_millis(250),
            clock_interval: Duration::from_millis(16),
            power_on_reason: PowerOnReason::PowerButton,
            avpack: AvPackType::HdmiNoAudio,
        }
    }
}

impl SmcConfig {
    /// Reads `XENON_SMC_*` environment variables, falling back to [`SmcConfig::default`] for
    /// anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let var = |name: &'static str| lookup(name).map(|v| (name, v.trim().to_owned()));

        let com_port = var("XENON_SMC_COM_PORT").map_or(defaults.com_port, |(_, v)| v);
        let socket_addr = var("XENON_SMC_SOCKET_ADDR").map_or(defaults.socket_addr, |(_, v)| v);
        let socket_port = match var("XENON_SMC_SOCKET_PORT") {
            Some((name, v)) => v.parse::<u16>().map_err(|_| invalid_env(name, v))?,
            None => defaults.socket_port,
        };
        let tray_step = match var("XENON_SMC_TRAY_STEP_MS") {
            Some((name, v)) => parse_millis(name, v)?,
            None => defaults.tray_step,
        };
        let clock_interval = match var("XENON_SMC_CLOCK_INTERVAL_MS") {
            Some((name, v)) => parse_millis(name, v)?,
            None => defaults.clock_interval,
        };
        let power_on_reason = match var("XENON_SMC_POWER_ON_REASON") {
            Some((name, v)) => parse_code(name, v)?,
            None => defaults.power_on_reason,
        };
        let avpack = match var("XENON_SMC_AVPACK") {
            Some((name, v)) => parse_code(name, v)?,
            None => defaults.avpack,
        };

        let config = Self {
            com_port,
            socket_addr,
            socket_port,
            tray_step,
            clock_interval,
            power_on_reason,
            avpack,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tray_step.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "tray_step",
                value: "must be non-zero".to_owned(),
            });
        }
        if self.clock_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "clock_interval",
                value: "must be non-zero".to_owned(),
            });
        }
        Ok(())
    }
}

fn invalid_env(var: &'static str, value: String) -> ConfigError {
    ConfigError::InvalidEnv { var, value }
}

fn parse_millis(var: &'static str, value: String) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid_env(var, value))
}

/// Parses a hex byte (`0x11` or `11`) into one of the wire enumerations.
pub fn parse_code<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: TryFrom<u8>,
{
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(&value);
    let code = u8::from_str_radix(digits, 16).ok();
    code.and_then(|code| T::try_from(code).ok())
        .ok_or_else(|| invalid_env(var, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(SmcConfig::from_lookup(lookup(&[])).unwrap(), SmcConfig::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = SmcConfig::from_lookup(lookup(&[
            ("XENON_SMC_COM_PORT", "/dev/pts/3"),
            ("XENON_SMC_SOCKET_PORT", " 7100 "),
            ("XENON_SMC_TRAY_STEP_MS", "10"),
            ("XENON_SMC_POWER_ON_REASON", "0x12"),
            ("XENON_SMC_AVPACK", "5b"),
        ]))
        .unwrap();

        assert_eq!(config.com_port, "/dev/pts/3");
        assert_eq!(config.socket_port, 7100);
        assert_eq!(config.tray_step, Duration::from_millis(10));
        assert_eq!(config.power_on_reason, PowerOnReason::EjectButton);
        assert_eq!(config.avpack, AvPackType::Vga);
    }

    #[test]
    fn codes_outside_the_enumerations_are_rejected() {
        let err = SmcConfig::from_lookup(lookup(&[("XENON_SMC_AVPACK", "0x00")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidEnv {
                var: "XENON_SMC_AVPACK",
                value: "0x00".to_owned()
            }
        );
    }

    #[test]
    fn zero_tray_step_is_invalid() {
        let err =
            SmcConfig::from_lookup(lookup(&[("XENON_SMC_TRAY_STEP_MS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "tray_step", .. }));
    }
}
