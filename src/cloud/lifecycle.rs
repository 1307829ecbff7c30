//! Lifecycle certificates: birth, disconnect and application list

use std::sync::Arc;
use std::time::Instant;

use crate::config::ConnectionOptions;
use crate::device::{DeviceInfoProvider, NOT_AVAILABLE};
use crate::protocol::{CloudMessage, Payload};

pub const METRIC_UPTIME: &str = "uptime";
pub const METRIC_DISPLAY_NAME: &str = "display_name";
pub const METRIC_APPLICATION_IDS: &str = "application_ids";
pub const METRIC_ACCEPT_ENCODING: &str = "accept_encoding";

/// Lifecycle message kinds, in flush priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleKind {
    Birth,
    AppList,
    Disconnect,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleKind::Birth => "birth",
            LifecycleKind::AppList => "app-list",
            LifecycleKind::Disconnect => "disconnect",
        }
    }

    fn suffix<'a>(&self, options: &'a ConnectionOptions) -> &'a str {
        match self {
            LifecycleKind::Birth => &options.birth_suffix,
            LifecycleKind::AppList => options.app_list_suffix(),
            LifecycleKind::Disconnect => &options.disconnect_suffix,
        }
    }
}

/// A built certificate ready to publish
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleMessage {
    pub kind: LifecycleKind,
    pub message: CloudMessage,
}

/// Builds lifecycle certificates from device metadata fetched at build time
pub struct LifecycleFactory {
    device: Arc<dyn DeviceInfoProvider>,
    started: Instant,
}

impl LifecycleFactory {
    pub fn new(device: Arc<dyn DeviceInfoProvider>) -> Self {
        Self {
            device,
            started: Instant::now(),
        }
    }

    pub fn build(
        &self,
        kind: LifecycleKind,
        options: &ConnectionOptions,
        app_ids: &[String],
    ) -> LifecycleMessage {
        let payload = match kind {
            LifecycleKind::Birth => self.birth_payload(options, app_ids),
            LifecycleKind::AppList => self.app_list_payload(options, app_ids),
            LifecycleKind::Disconnect => self.disconnect_payload(),
        };

        let (app_id, app_topic) = kind
            .suffix(options)
            .split_once(options.topic_separator.as_str())
            .unwrap_or((kind.suffix(options), ""));

        let message = CloudMessage::to_app(app_id, app_topic, payload)
            .control()
            .with_qos(options.lifecycle_qos())
            .retained(options.lifecycle_retain)
            .with_priority(options.lifecycle_priority);

        LifecycleMessage { kind, message }
    }

    fn uptime_millis(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    fn birth_payload(&self, options: &ConnectionOptions, app_ids: &[String]) -> Payload {
        let profile = self.device.profile();
        let mut payload = Payload::now();

        payload.add_metric(METRIC_UPTIME, self.uptime_millis());
        for (name, value) in [
            (METRIC_DISPLAY_NAME, &profile.display_name),
            ("model_name", &profile.model_name),
            ("model_id", &profile.model_id),
            ("part_number", &profile.part_number),
            ("serial_number", &profile.serial_number),
            ("firmware_version", &profile.firmware_version),
            ("bios_version", &profile.bios_version),
            ("cpu_version", &profile.cpu_version),
            ("os", &profile.os_name),
            ("os_version", &profile.os_version),
            ("os_arch", &profile.os_arch),
            ("runtime_version", &profile.runtime_version),
            ("connection_interface", &profile.connection_interface),
            ("connection_ip", &profile.connection_ip),
        ] {
            payload.add_metric(name, value.as_deref().unwrap_or(NOT_AVAILABLE));
        }
        if let Some(processors) = profile.available_processors {
            payload.add_metric("available_processors", processors);
        }
        if let Some(memory) = profile.total_memory_kb {
            payload.add_metric("total_memory", memory);
        }

        payload.add_metric(METRIC_APPLICATION_IDS, app_ids.join(","));
        payload.add_metric(METRIC_ACCEPT_ENCODING, accept_encoding(options));
        payload.add_metric("payload_encoding", options.payload_encoding.as_str());

        let modem = self.device.modem().unwrap_or_default();
        for (name, value) in [
            ("modem_imei", &modem.imei),
            ("modem_iccid", &modem.iccid),
            ("modem_imsi", &modem.imsi),
            ("modem_firmware_version", &modem.firmware_version),
        ] {
            payload.add_metric(name, value.as_deref().unwrap_or(NOT_AVAILABLE));
        }
        match modem.rssi {
            Some(rssi) => payload.add_metric("modem_rssi", rssi),
            None => payload.add_metric("modem_rssi", NOT_AVAILABLE),
        }

        payload.position = self.device.position();
        payload
    }

    fn app_list_payload(&self, options: &ConnectionOptions, app_ids: &[String]) -> Payload {
        let profile = self.device.profile();
        Payload::now()
            .with_metric(METRIC_UPTIME, self.uptime_millis())
            .with_metric(
                METRIC_DISPLAY_NAME,
                profile.display_name.as_deref().unwrap_or(NOT_AVAILABLE),
            )
            .with_metric(METRIC_APPLICATION_IDS, app_ids.join(","))
            .with_metric(METRIC_ACCEPT_ENCODING, accept_encoding(options))
    }

    fn disconnect_payload(&self) -> Payload {
        let profile = self.device.profile();
        Payload::now()
            .with_metric(METRIC_UPTIME, self.uptime_millis())
            .with_metric(
                METRIC_DISPLAY_NAME,
                profile.display_name.as_deref().unwrap_or(NOT_AVAILABLE),
            )
    }
}

fn accept_encoding(options: &ConnectionOptions) -> &'static str {
    if options.encode_gzip {
        "gzip"
    } else {
        "identity"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceProfile, ModemInfo, StaticDeviceInfo};
    use crate::protocol::{Destination, MetricValue, Position};
    use crate::transport::QoS;

    fn factory(provider: StaticDeviceInfo) -> LifecycleFactory {
        LifecycleFactory::new(Arc::new(provider))
    }

    #[test]
    fn test_birth_topic_and_delivery_options() {
        let options = ConnectionOptions::default();
        let built = factory(StaticDeviceInfo::default()).build(LifecycleKind::Birth, &options, &[]);

        assert_eq!(built.kind, LifecycleKind::Birth);
        assert_eq!(
            built.message.destination.resolve(&options).unwrap(),
            "$EDC/#account-name/#client-id/MQTT/BIRTH"
        );
        assert_eq!(built.message.qos, QoS::AtLeastOnce);
        assert!(!built.message.retain);
        assert_eq!(built.message.priority, 0);
    }

    #[test]
    fn test_birth_marks_missing_metadata_as_na() {
        let options = ConnectionOptions::default();
        let built = factory(StaticDeviceInfo::default()).build(LifecycleKind::Birth, &options, &[]);
        let payload = &built.message.payload;

        assert_eq!(payload.string_metric("serial_number"), Some("NA"));
        assert_eq!(payload.string_metric("modem_imei"), Some("NA"));
        assert_eq!(payload.string_metric("modem_rssi"), Some("NA"));
        assert_eq!(payload.position, None);
    }

    #[test]
    fn test_birth_carries_apps_modem_and_position() {
        let options = ConnectionOptions::default();
        let provider = StaticDeviceInfo::new(DeviceProfile {
            display_name: Some("Yard gateway".to_string()),
            ..Default::default()
        })
        .with_modem(ModemInfo {
            imei: Some("490154203237518".to_string()),
            rssi: Some(-71),
            ..Default::default()
        })
        .with_position(Position::new(45.46, 9.19));

        let apps = vec!["CONF-V1".to_string(), "heater".to_string()];
        let built = factory(provider).build(LifecycleKind::Birth, &options, &apps);
        let payload = &built.message.payload;

        assert_eq!(payload.string_metric(METRIC_DISPLAY_NAME), Some("Yard gateway"));
        assert_eq!(payload.string_metric(METRIC_APPLICATION_IDS), Some("CONF-V1,heater"));
        assert_eq!(payload.string_metric("modem_imei"), Some("490154203237518"));
        assert_eq!(payload.metric("modem_rssi"), Some(&MetricValue::Int(-71)));
        assert_eq!(payload.string_metric(METRIC_ACCEPT_ENCODING), Some("gzip"));
        assert_eq!(payload.position.as_ref().and_then(|p| p.latitude), Some(45.46));
        assert!(payload.timestamp.is_some());
    }

    #[test]
    fn test_disconnect_payload() {
        let options = ConnectionOptions::default();
        let built =
            factory(StaticDeviceInfo::default()).build(LifecycleKind::Disconnect, &options, &[]);

        assert_eq!(
            built.message.destination,
            Destination::App {
                app_id: "MQTT".to_string(),
                app_topic: "DC".to_string(),
                control: true,
                device_id: None,
            }
        );
        assert!(built.message.payload.metric(METRIC_UPTIME).is_some());
        assert_eq!(built.message.payload.string_metric(METRIC_DISPLAY_NAME), Some("NA"));
        assert_eq!(built.message.payload.metrics.len(), 2);
    }

    #[test]
    fn test_app_list_is_resent_on_the_birth_topic() {
        let options = ConnectionOptions::default();
        let apps = vec!["heater".to_string()];
        let factory = factory(StaticDeviceInfo::default());

        let birth = factory.build(LifecycleKind::Birth, &options, &apps);
        let app_list = factory.build(LifecycleKind::AppList, &options, &apps);

        assert_eq!(
            app_list.message.destination.resolve(&options).unwrap(),
            birth.message.destination.resolve(&options).unwrap()
        );
    }

    #[test]
    fn test_app_list_uses_configured_suffix() {
        let options = ConnectionOptions {
            app_list_suffix: Some("MQTT/APPS".to_string()),
            lifecycle_qos: 0,
            ..Default::default()
        };
        let apps = vec!["heater".to_string()];
        let built = factory(StaticDeviceInfo::default()).build(LifecycleKind::AppList, &options, &apps);

        assert_eq!(
            built.message.destination.resolve(&options).unwrap(),
            "$EDC/#account-name/#client-id/MQTT/APPS"
        );
        assert_eq!(built.message.qos, QoS::AtMostOnce);
        assert_eq!(
            built.message.payload.string_metric(METRIC_APPLICATION_IDS),
            Some("heater")
        );
    }
}
