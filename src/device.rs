//! Device metadata queried when lifecycle certificates are built
//!
//! The gateway platform (GPS, modem and system readers) is reached through the
//! narrow [`DeviceInfoProvider`] interface. Values the platform cannot supply
//! are reported as `None` and rendered as [`NOT_AVAILABLE`] in certificates.

use chrono::{DateTime, Utc};

use crate::config::DeviceSection;
use crate::protocol::Position;

/// Placeholder for metadata the platform cannot supply
pub const NOT_AVAILABLE: &str = "NA";

/// Static identity and software inventory of the gateway
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceProfile {
    pub display_name: Option<String>,
    pub model_name: Option<String>,
    pub model_id: Option<String>,
    pub part_number: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub bios_version: Option<String>,
    pub cpu_version: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub os_arch: Option<String>,
    pub runtime_version: Option<String>,
    pub connection_interface: Option<String>,
    pub connection_ip: Option<String>,
    pub available_processors: Option<i32>,
    pub total_memory_kb: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
}

impl DeviceProfile {
    /// Profile built from the `[device]` section of the configuration file
    pub fn from_config(section: &DeviceSection) -> Self {
        Self {
            display_name: section.display_name.clone(),
            model_name: section.model_name.clone(),
            model_id: section.model_id.clone(),
            serial_number: section.serial_number.clone(),
            firmware_version: section.firmware_version.clone(),
            os_name: section.os_name.clone().or_else(|| Some(std::env::consts::OS.to_string())),
            os_version: section.os_version.clone(),
            os_arch: Some(std::env::consts::ARCH.to_string()),
            runtime_version: Some(concat!("cloudlink ", env!("CARGO_PKG_VERSION")).to_string()),
            connection_interface: section.connection_interface.clone(),
            available_processors: std::thread::available_parallelism()
                .ok()
                .and_then(|n| i32::try_from(n.get()).ok()),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

/// Cellular modem details, present only when the gateway has a modem
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModemInfo {
    pub imei: Option<String>,
    pub iccid: Option<String>,
    pub imsi: Option<String>,
    pub rssi: Option<i32>,
    pub firmware_version: Option<String>,
}

/// Narrow view of the platform readers
pub trait DeviceInfoProvider: Send + Sync {
    fn profile(&self) -> DeviceProfile;

    fn modem(&self) -> Option<ModemInfo> {
        None
    }

    /// Current position when the GPS reports a lock
    fn position(&self) -> Option<Position> {
        None
    }
}

/// Provider with fixed values, used by the binary and in tests
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceInfo {
    pub profile: DeviceProfile,
    pub modem: Option<ModemInfo>,
    pub position: Option<Position>,
}

impl StaticDeviceInfo {
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            ..Default::default()
        }
    }

    pub fn with_modem(mut self, modem: ModemInfo) -> Self {
        self.modem = Some(modem);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }
}

impl DeviceInfoProvider for StaticDeviceInfo {
    fn profile(&self) -> DeviceProfile {
        self.profile.clone()
    }

    fn modem(&self) -> Option<ModemInfo> {
        self.modem.clone()
    }

    fn position(&self) -> Option<Position> {
        self.position.clone()
    }
}
