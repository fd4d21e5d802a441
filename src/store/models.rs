use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PortRangeRow {
    pub id: i64,
    pub name: String,
    pub start_port: u16,
    pub end_port: u16,
    pub active: bool,
}

impl PortRangeRow {
    pub fn capacity(&self) -> u16 {
        self.end_port - self.start_port + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PortAllocation {
    pub id: i64,
    pub project: String,
    pub service_name: String,
    pub port: u16,
    pub service_type: String,
    pub host: String,
    pub protocol: String,
    pub status: String,
    pub cloudflare_hostname: Option<String>,
    pub allocated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

/// Secret metadata as exposed by listings. The plaintext never leaves the
/// `get` path and the ciphertext columns never leave the store module.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct SecretMetadata {
    pub key_path: String,
    pub description: String,
    pub scope: String,
    pub project: Option<String>,
    pub service: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub needs_rotation: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full secret row including the encrypted columns. Internal to the
/// secrets store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SecretRow {
    pub key_path: String,
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CnameRecord {
    pub id: i64,
    pub subdomain: String,
    pub domain: String,
    pub full_hostname: String,
    pub target_service: String,
    pub target_type: String,
    pub container_name: Option<String>,
    pub docker_network: Option<String>,
    pub project: String,
    pub cloudflare_record_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct TunnelHealthRow {
    pub timestamp: DateTime<Utc>,
    pub status: String,
    pub uptime_s: i64,
    pub restart_count: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DomainRow {
    pub domain: String,
    pub zone_id: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AuditRow {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub project: Option<String>,
    pub details: String,
    pub success: bool,
    pub error_message: Option<String>,
}
