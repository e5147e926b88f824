//! Integration tests for the AOA wire protocol
//!
//! Tests the handshake request sequence, identification string encoding,
//! and the identity/filter helpers used by the host.

use protocol::{
    ACCESSORY_GET_PROTOCOL, ACCESSORY_SEND_STRING, ACCESSORY_START, AccessoryProtocolVersion,
    AccessoryString, AccessoryStrings, ControlSetup, DeviceClass, DeviceFilter, DeviceIdentity,
    PRODUCT_ID_ACCESSORY_ADB, PRODUCT_ID_SAMSUNG, ProtocolError, VENDOR_ID_GOOGLE,
    VENDOR_ID_SAMSUNG,
};

fn make_identity(vendor_id: u16, product_id: u16) -> DeviceIdentity {
    DeviceIdentity {
        vendor_id,
        product_id,
        serial_number: Some("RF8N30ABCDE".to_string()),
        bus_number: 3,
        device_path: "3-1".to_string(),
    }
}

mod handshake_sequence {
    use super::*;

    #[test]
    fn test_handshake_requests_in_wire_order() {
        let strings = AccessoryStrings::default();
        let mut sequence = vec![(ControlSetup::get_protocol(), 2usize)];

        for (slot, payload) in strings.encode_all().expect("Failed to encode strings") {
            sequence.push((ControlSetup::send_string(slot), payload.len()));
        }
        sequence.push((ControlSetup::start_accessory(), 0));

        let requests: Vec<u8> = sequence.iter().map(|(s, _)| s.request).collect();
        assert_eq!(
            requests,
            vec![
                ACCESSORY_GET_PROTOCOL,
                ACCESSORY_SEND_STRING,
                ACCESSORY_SEND_STRING,
                ACCESSORY_SEND_STRING,
                ACCESSORY_SEND_STRING,
                ACCESSORY_SEND_STRING,
                ACCESSORY_SEND_STRING,
                ACCESSORY_START,
            ]
        );

        let indices: Vec<u16> = sequence[1..7].iter().map(|(s, _)| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);

        // "Galaxy Scanner Desc" + NUL
        assert_eq!(sequence[3].1, 20);
        assert_eq!(sequence[7].1, 0);
    }

    #[test]
    fn test_only_get_protocol_is_device_to_host() {
        assert!(ControlSetup::get_protocol().is_in());
        for slot in AccessoryString::ALL {
            assert!(!ControlSetup::send_string(slot).is_in());
        }
        assert!(!ControlSetup::start_accessory().is_in());
    }

    #[test]
    fn test_custom_strings_are_sent_verbatim() {
        let strings = AccessoryStrings {
            manufacturer: "Acme".to_string(),
            model: "Echo".to_string(),
            description: "Loopback accessory".to_string(),
            version: "2.1".to_string(),
            uri: "https://example.com/echo".to_string(),
            serial: "0001".to_string(),
        };

        let encoded = strings.encode_all().unwrap();
        let text: Vec<&[u8]> = encoded.iter().map(|(_, b)| &b[..b.len() - 1]).collect();
        assert_eq!(
            text,
            vec![
                b"Acme".as_slice(),
                b"Echo",
                b"Loopback accessory",
                b"2.1",
                b"https://example.com/echo",
                b"0001"
            ]
        );
    }

    #[test]
    fn test_invalid_string_rejected_before_any_transfer() {
        let strings = AccessoryStrings {
            serial: "séríal".to_string(),
            ..AccessoryStrings::default()
        };

        match strings.validate() {
            Err(ProtocolError::NonAscii { slot, .. }) => assert_eq!(slot, "serial"),
            other => panic!("Expected NonAscii error, got {:?}", other),
        }
        assert!(strings.encode_all().is_err());
    }
}

mod version {
    use super::*;

    #[test]
    fn test_version_ordering() {
        let v1 = AccessoryProtocolVersion::from_response(&[1, 0]).unwrap();
        let v2 = AccessoryProtocolVersion::from_response(&[2, 0]).unwrap();
        assert!(v1 < v2);
        assert_eq!(v2.to_string(), "AOA v2");
    }
}

mod identity {
    use super::*;

    #[test]
    fn test_known_devices_classify() {
        let phone = make_identity(VENDOR_ID_SAMSUNG, PRODUCT_ID_SAMSUNG);
        let accessory = make_identity(VENDOR_ID_GOOGLE, PRODUCT_ID_ACCESSORY_ADB);

        assert_eq!(DeviceClass::classify(&phone), DeviceClass::Switchable);
        assert_eq!(DeviceClass::classify(&accessory), DeviceClass::Accessory);
    }

    #[test]
    fn test_default_watch_filters_roundtrip_text() {
        for text in ["0x04e8:0x6860", "0x18d1:0x2d01", "0x18d1:*"] {
            let filter: DeviceFilter = text.parse().unwrap();
            assert_eq!(filter.to_string(), text);
        }
    }
}
