//! Worker process settings.

use std::path::PathBuf;

use clap::Parser;

const LOG_LEVELS: &[&str] = &["error", "warn", "debug", "trace"];

/// Command line settings of the worker binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "sfu-worker", about = "SFU media worker")]
pub struct Settings {
    /// Logging level.
    #[arg(long = "logLevel", default_value = "warn")]
    pub log_level: String,

    /// Logging tags to enable. Repeatable.
    #[arg(long = "logTag")]
    pub log_tags: Vec<String>,

    /// Lowest RTC port the transport layer may bind.
    #[arg(long = "rtcMinPort", default_value_t = 10_000)]
    pub rtc_min_port: u16,

    /// Highest RTC port the transport layer may bind.
    #[arg(long = "rtcMaxPort", default_value_t = 59_999)]
    pub rtc_max_port: u16,

    /// DTLS certificate in PEM format.
    #[arg(long = "dtlsCertificateFile")]
    pub dtls_certificate_file: Option<PathBuf>,

    /// DTLS private key in PEM format.
    #[arg(long = "dtlsPrivateKeyFile")]
    pub dtls_private_key_file: Option<PathBuf>,
}

impl Settings {
    /// Check settings consistency. The worker exits with code 42 when
    /// this fails.
    pub fn validate(&self) -> Result<(), String> {
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(format!("invalid logLevel: {}", self.log_level));
        }

        if self.rtc_min_port > self.rtc_max_port {
            return Err(format!(
                "rtcMinPort {} above rtcMaxPort {}",
                self.rtc_min_port, self.rtc_max_port
            ));
        }

        if self.dtls_certificate_file.is_some() != self.dtls_private_key_file.is_some() {
            return Err(
                "dtlsCertificateFile and dtlsPrivateKeyFile must be given together".into(),
            );
        }

        Ok(())
    }
}
