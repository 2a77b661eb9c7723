use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Level, event};

use crate::fsm::StateSnapshot;
use crate::verify::VerificationReport;

static AUDIT_ENABLED: AtomicBool = AtomicBool::new(true);

/// Audit records of load activity, emitted as one JSON object per event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    TargetStarted {
        #[serde(flatten)]
        common: CommonFields,
        part_number: String,
        bind_addr: String,
        root_dir: String,
    },

    TargetShutdown {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
    },

    /// System mode or substate changed
    ModeChanged {
        #[serde(flatten)]
        common: CommonFields,
        from: String,
        to: String,
        trigger: String,
    },

    /// Maintenance entry refused or abandoned
    MaintenanceRefused {
        #[serde(flatten)]
        common: CommonFields,
        reason: String,
    },

    /// LUI returned for a read request
    InitializationServed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        status: String,
    },

    WriteRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
    },

    WriteRequestDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
    },

    WriteCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_received: u64,
        blocks_received: u64,
        duration_ms: u64,
    },

    WriteFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
        blocks_received: u64,
    },

    /// Load file fetched from the data loader
    DownloadCompleted {
        #[serde(flatten)]
        common: CommonFields,
        server_addr: String,
        part_number: String,
        bytes_received: u64,
        duration_ms: u64,
    },

    DownloadFailed {
        #[serde(flatten)]
        common: CommonFields,
        server_addr: String,
        part_number: String,
        error: String,
    },

    /// LUS uploaded to the data loader
    StatusUploaded {
        #[serde(flatten)]
        common: CommonFields,
        server_addr: String,
        filename: String,
        status: String,
    },

    StatusUploadFailed {
        #[serde(flatten)]
        common: CommonFields,
        server_addr: String,
        filename: String,
        error: String,
    },

    VerificationResult {
        #[serde(flatten)]
        common: CommonFields,
        image: String,
        format_ok: bool,
        part_number_ok: bool,
        integrity_ok: bool,
    },

    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },

    ConfigurationLoaded {
        #[serde(flatten)]
        common: CommonFields,
        config_file: String,
    },

    ConfigurationError {
        #[serde(flatten)]
        common: CommonFields,
        config_file: String,
        error: String,
    },
}

/// Common fields present in all audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    /// info, warn or error
    pub severity: String,
    /// Ties together the records of one transfer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommonFields {
    pub fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "a615-target".to_string(),
            severity: severity.to_string(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(severity: &str, correlation_id: Option<&str>) -> Self {
        let mut fields = Self::new(severity);
        fields.correlation_id = correlation_id.map(str::to_string);
        fields
    }
}

impl AuditEvent {
    /// Log this audit event through tracing.
    pub fn log(&self) {
        if !AUDIT_ENABLED.load(Ordering::Relaxed) {
            return;
        }
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"Failed to serialize audit event: {:?}\"}}",
                self
            )
        });
        match self.common().severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    pub fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::TargetStarted { common, .. }
            | AuditEvent::TargetShutdown { common, .. }
            | AuditEvent::ModeChanged { common, .. }
            | AuditEvent::MaintenanceRefused { common, .. }
            | AuditEvent::InitializationServed { common, .. }
            | AuditEvent::WriteRequest { common, .. }
            | AuditEvent::WriteRequestDenied { common, .. }
            | AuditEvent::WriteCompleted { common, .. }
            | AuditEvent::WriteFailed { common, .. }
            | AuditEvent::DownloadCompleted { common, .. }
            | AuditEvent::DownloadFailed { common, .. }
            | AuditEvent::StatusUploaded { common, .. }
            | AuditEvent::StatusUploadFailed { common, .. }
            | AuditEvent::VerificationResult { common, .. }
            | AuditEvent::ProtocolViolation { common, .. }
            | AuditEvent::ConfigurationLoaded { common, .. }
            | AuditEvent::ConfigurationError { common, .. } => common,
        }
    }
}

/// Audit logger for load operations
pub struct AuditLogger;

impl AuditLogger {
    pub fn set_enabled(enabled: bool) {
        AUDIT_ENABLED.store(enabled, Ordering::Relaxed);
    }

    /// Fresh identifier for the records of one transfer
    pub fn new_correlation_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn target_started(part_number: &str, bind_addr: &str, root_dir: &str) {
        AuditEvent::TargetStarted {
            common: CommonFields::new("info"),
            part_number: part_number.to_string(),
            bind_addr: bind_addr.to_string(),
            root_dir: root_dir.to_string(),
        }
        .log();
    }

    pub fn target_shutdown(reason: &str) {
        AuditEvent::TargetShutdown {
            common: CommonFields::new("info"),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn mode_changed(from: StateSnapshot, to: StateSnapshot, trigger: &str) {
        AuditEvent::ModeChanged {
            common: CommonFields::new("info"),
            from: from.to_string(),
            to: to.to_string(),
            trigger: trigger.to_string(),
        }
        .log();
    }

    pub fn maintenance_refused(reason: &str) {
        AuditEvent::MaintenanceRefused {
            common: CommonFields::new("warn"),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn initialization_served(
        client_addr: SocketAddr,
        filename: &str,
        status: &str,
        correlation_id: Option<&str>,
    ) {
        AuditEvent::InitializationServed {
            common: CommonFields::with_correlation("info", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            status: status.to_string(),
        }
        .log();
    }

    pub fn write_request(client_addr: SocketAddr, filename: &str, correlation_id: Option<&str>) {
        AuditEvent::WriteRequest {
            common: CommonFields::with_correlation("info", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
        }
        .log();
    }

    pub fn write_request_denied(
        client_addr: SocketAddr,
        filename: &str,
        reason: &str,
        correlation_id: Option<&str>,
    ) {
        AuditEvent::WriteRequestDenied {
            common: CommonFields::with_correlation("warn", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn write_completed(
        client_addr: SocketAddr,
        filename: &str,
        bytes_received: u64,
        blocks_received: u64,
        duration_ms: u64,
        correlation_id: Option<&str>,
    ) {
        AuditEvent::WriteCompleted {
            common: CommonFields::with_correlation("info", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_received,
            blocks_received,
            duration_ms,
        }
        .log();
    }

    pub fn write_failed(
        client_addr: SocketAddr,
        filename: &str,
        error: &str,
        blocks_received: u64,
        correlation_id: Option<&str>,
    ) {
        AuditEvent::WriteFailed {
            common: CommonFields::with_correlation("error", correlation_id),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
            blocks_received,
        }
        .log();
    }

    pub fn download_completed(
        server_addr: SocketAddr,
        part_number: &str,
        bytes_received: u64,
        duration_ms: u64,
        correlation_id: Option<&str>,
    ) {
        AuditEvent::DownloadCompleted {
            common: CommonFields::with_correlation("info", correlation_id),
            server_addr: server_addr.to_string(),
            part_number: part_number.to_string(),
            bytes_received,
            duration_ms,
        }
        .log();
    }

    pub fn download_failed(
        server_addr: SocketAddr,
        part_number: &str,
        error: &str,
        correlation_id: Option<&str>,
    ) {
        AuditEvent::DownloadFailed {
            common: CommonFields::with_correlation("error", correlation_id),
            server_addr: server_addr.to_string(),
            part_number: part_number.to_string(),
            error: error.to_string(),
        }
        .log();
    }

    pub fn status_uploaded(server_addr: SocketAddr, filename: &str, status: &str) {
        AuditEvent::StatusUploaded {
            common: CommonFields::new("info"),
            server_addr: server_addr.to_string(),
            filename: filename.to_string(),
            status: status.to_string(),
        }
        .log();
    }

    pub fn status_upload_failed(server_addr: SocketAddr, filename: &str, error: &str) {
        AuditEvent::StatusUploadFailed {
            common: CommonFields::new("warn"),
            server_addr: server_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
        }
        .log();
    }

    pub fn verification_result(image: &str, report: &VerificationReport) {
        let severity = if report.passed() { "info" } else { "error" };
        AuditEvent::VerificationResult {
            common: CommonFields::new(severity),
            image: image.to_string(),
            format_ok: report.format_ok,
            part_number_ok: report.pn_ok,
            integrity_ok: report.hash_ok,
        }
        .log();
    }

    pub fn protocol_violation(client_addr: SocketAddr, violation: &str) {
        AuditEvent::ProtocolViolation {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        }
        .log();
    }

    pub fn configuration_loaded(config_file: &str) {
        AuditEvent::ConfigurationLoaded {
            common: CommonFields::new("info"),
            config_file: config_file.to_string(),
        }
        .log();
    }

    pub fn configuration_error(config_file: &str, error: &str) {
        AuditEvent::ConfigurationError {
            common: CommonFields::new("error"),
            config_file: config_file.to_string(),
            error: error.to_string(),
        }
        .log();
    }
}
