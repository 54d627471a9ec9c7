use pouch_transport::radio::AdvReport;
use uuid::Uuid;

/// GATT protocol revision this gateway speaks.
pub const POUCH_GATT_VERSION: u8 = 1;

/// Low nibble of the advertised version byte: the device's own protocol revision.
pub const ADV_VERSION_SELF_MASK: u8 = 0x0F;
/// Advertised flag: the device has data to sync and wants a gateway.
pub const ADV_FLAG_SYNC_REQUEST: u8 = 0x01;

/// Length of the service data payload following the service UUID.
pub const ADV_DATA_LEN: usize = 2;

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expands a 16-bit SIG-assigned UUID onto the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
}

pub const SERVICE_UUID16: u16 = 0xFC49;
pub const SERVICE_UUID: Uuid = uuid_from_u16(SERVICE_UUID16);
/// 128-bit service UUID advertised by older firmware.
pub const LEGACY_SERVICE_UUID: Uuid = Uuid::from_u128(0x89a316ae_89b7_4ef6_b1d3_5c9a6e27d272);

/// Client Characteristic Configuration descriptor.
pub const CCC_UUID: Uuid = uuid_from_u16(0x2902);
pub const CCC_NOTIFY: [u8; 2] = [0x01, 0x00];

pub const INFO_CHAR_UUID: Uuid = Uuid::from_u128(0x89a316af_89b7_4ef6_b1d3_5c9a6e27d272);
pub const DOWNLINK_CHAR_UUID: Uuid = Uuid::from_u128(0x89a316b0_89b7_4ef6_b1d3_5c9a6e27d272);
pub const UPLINK_CHAR_UUID: Uuid = Uuid::from_u128(0x89a316b1_89b7_4ef6_b1d3_5c9a6e27d272);
pub const SERVER_CERT_CHAR_UUID: Uuid = Uuid::from_u128(0x89a316b2_89b7_4ef6_b1d3_5c9a6e27d272);
pub const DEVICE_CERT_CHAR_UUID: Uuid = Uuid::from_u128(0x89a316b3_89b7_4ef6_b1d3_5c9a6e27d272);

/// Service UUIDs in the order discovery tries them.
pub const SERVICE_UUIDS: [Uuid; 2] = [SERVICE_UUID, LEGACY_SERVICE_UUID];

/// Logical characteristics of the Pouch service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    Info,
    Downlink,
    Uplink,
    ServerCert,
    DeviceCert,
}

impl Characteristic {
    pub const ALL: [Characteristic; 5] = [
        Characteristic::Info,
        Characteristic::Downlink,
        Characteristic::Uplink,
        Characteristic::ServerCert,
        Characteristic::DeviceCert,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Characteristic::Info => INFO_CHAR_UUID,
            Characteristic::Downlink => DOWNLINK_CHAR_UUID,
            Characteristic::Uplink => UPLINK_CHAR_UUID,
            Characteristic::ServerCert => SERVER_CERT_CHAR_UUID,
            Characteristic::DeviceCert => DEVICE_CERT_CHAR_UUID,
        }
    }

    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == *uuid)
    }

    pub fn label(self) -> &'static str {
        match self {
            Characteristic::Info => "info",
            Characteristic::Downlink => "downlink",
            Characteristic::Uplink => "uplink",
            Characteristic::ServerCert => "server-cert",
            Characteristic::DeviceCert => "device-cert",
        }
    }
}

/// Pouch service data carried in advertisements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvData {
    pub version: u8,
    pub flags: u8,
}

impl AdvData {
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [version, flags, ..] => Some(Self {
                version: *version,
                flags: *flags,
            }),
            _ => None,
        }
    }

    pub fn encode(&self) -> [u8; ADV_DATA_LEN] {
        [self.version, self.flags]
    }

    pub fn self_version(&self) -> u8 {
        self.version & ADV_VERSION_SELF_MASK
    }

    pub fn is_compatible(&self) -> bool {
        self.self_version() == POUCH_GATT_VERSION
    }

    pub fn sync_requested(&self) -> bool {
        self.flags & ADV_FLAG_SYNC_REQUEST != 0
    }
}

/// Extracts Pouch service data from a report, short UUID form first.
pub fn find_pouch_adv(report: &AdvReport) -> Option<AdvData> {
    SERVICE_UUIDS.iter().find_map(|svc| {
        report
            .service_data
            .iter()
            .find(|(uuid, _)| uuid == svc)
            .and_then(|(_, data)| AdvData::decode(data))
    })
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use pouch_core::PeerAddr;
    use pouch_transport::radio::AdvKind;

    use super::*;

    fn report(service_data: Vec<(Uuid, Bytes)>) -> AdvReport {
        AdvReport {
            addr: PeerAddr::new("c0:ff:ee:00:00:01"),
            rssi: -60,
            kind: AdvKind::ConnectableUndirected,
            service_data,
        }
    }

    #[test]
    fn short_uuids_expand_onto_bluetooth_base() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "0000fc49-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CCC_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            LEGACY_SERVICE_UUID.to_string(),
            "89a316ae-89b7-4ef6-b1d3-5c9a6e27d272"
        );
    }

    #[test]
    fn characteristic_uuids_roundtrip() {
        for ch in Characteristic::ALL {
            assert_eq!(Characteristic::from_uuid(&ch.uuid()), Some(ch));
        }
        assert_eq!(Characteristic::from_uuid(&SERVICE_UUID), None);
    }

    #[test]
    fn adv_data_checks_self_version_and_sync_flag() {
        let adv = AdvData {
            version: 0x21,
            flags: ADV_FLAG_SYNC_REQUEST,
        };
        assert_eq!(adv.self_version(), 1);
        assert!(adv.is_compatible());
        assert!(adv.sync_requested());

        let idle = AdvData::decode(&[0x01, 0x00]).unwrap();
        assert!(!idle.sync_requested());
        assert!(AdvData::decode(&[0x01]).is_none());
    }

    #[test]
    fn finds_service_data_under_either_uuid() {
        let data = Bytes::from_static(&[0x01, 0x01]);
        let short = report(vec![(SERVICE_UUID, data.clone())]);
        let legacy = report(vec![(LEGACY_SERVICE_UUID, data)]);
        let other = report(vec![(uuid_from_u16(0x180f), Bytes::from_static(&[0x01, 0x01]))]);

        assert!(find_pouch_adv(&short).is_some());
        assert!(find_pouch_adv(&legacy).is_some());
        assert!(find_pouch_adv(&other).is_none());
    }
}
