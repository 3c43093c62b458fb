use super::sysfs::parse_apka_mkvps;
use super::*;
use std::fs;

fn ep(unit: u8, subunit: u16) -> Endpoint {
    Endpoint::new(unit, subunit)
}

#[test]
fn test_endpoint_parse_and_display() {
    let endpoint: Endpoint = "3.12".parse().unwrap();
    assert_eq!(endpoint, ep(3, 0x12));
    assert_eq!(endpoint.to_string(), "03.0012");

    let endpoint: Endpoint = " 0a.00ff ".parse().unwrap();
    assert_eq!(endpoint, ep(0x0a, 0xff));

    assert!("3".parse::<Endpoint>().is_err());
    assert!("100.1".parse::<Endpoint>().is_err());
    assert!("3.10000".parse::<Endpoint>().is_err());
    assert!("x.1".parse::<Endpoint>().is_err());
}

#[test]
fn test_endpoint_serde_uses_canonical_form() {
    let json = serde_json::to_string(&ep(4, 0x2f)).unwrap();
    assert_eq!(json, "\"04.002f\"");
    let back: Endpoint = serde_json::from_str("\"4.2f\"").unwrap();
    assert_eq!(back, ep(4, 0x2f));
}

#[test]
fn test_family_parse_is_case_insensitive() {
    assert_eq!("cca".parse::<AdapterFamily>().unwrap(), AdapterFamily::Cca);
    assert_eq!("Ep11".parse::<AdapterFamily>().unwrap(), AdapterFamily::Ep11);
    assert!("ANY".parse::<AdapterFamily>().is_err());
}

#[test]
fn test_validate_endpoints_takes_family_from_first() {
    let directory = StaticAdapterDirectory::new()
        .with_adapter(ep(1, 1), AdapterFamily::Ep11, 1)
        .with_adapter(ep(2, 1), AdapterFamily::Ep11, 1);

    let family = validate_endpoints(&directory, &[ep(1, 1), ep(2, 1)]).unwrap();
    assert_eq!(family, AdapterFamily::Ep11);
}

#[test]
fn test_validate_endpoints_rejects_mixed_and_offline() {
    let mut directory = StaticAdapterDirectory::new()
        .with_adapter(ep(1, 1), AdapterFamily::Cca, 1)
        .with_adapter(ep(2, 1), AdapterFamily::Ep11, 1);

    let err = validate_endpoints(&directory, &[ep(1, 1), ep(2, 1)]).unwrap_err();
    assert_eq!(err.error_code(), error_codes::ADAPTER_FAMILY_MISMATCH);

    directory.set_online(ep(1, 1), false);
    let err = validate_endpoints(&directory, &[ep(1, 1)]).unwrap_err();
    assert_eq!(err.error_code(), error_codes::ADAPTER_OFFLINE);

    let err = validate_endpoints(&directory, &[ep(9, 9)]).unwrap_err();
    assert_eq!(err.error_code(), error_codes::UNKNOWN_ADAPTER);

    assert!(validate_endpoints(&directory, &[]).is_err());
}

#[test]
fn test_cross_check_requires_same_current_key() {
    let directory = StaticAdapterDirectory::new()
        .with_adapter(ep(1, 1), AdapterFamily::Cca, 0xaa)
        .with_adapter(ep(2, 1), AdapterFamily::Cca, 0xaa)
        .with_adapter(ep(3, 1), AdapterFamily::Cca, 0xbb);

    assert!(cross_check_master_keys(&directory, &[ep(1, 1), ep(2, 1)]).is_ok());

    let err = cross_check_master_keys(&directory, &[ep(1, 1), ep(3, 1)]).unwrap_err();
    assert_eq!(err.kind(), crate::error::ErrorKind::InconsistentAdapterSetup);
}

#[test]
fn test_cross_check_rejects_invalid_current_register() {
    let mut directory = StaticAdapterDirectory::new();
    directory.insert(
        ep(1, 1),
        StaticAdapter {
            family: AdapterFamily::Cca,
            online: true,
            master_key: MasterKeyState {
                current: MasterKeyRegister::empty(),
                new: MasterKeyRegister::empty(),
            },
        },
    );

    assert!(cross_check_master_keys(&directory, &[ep(1, 1)]).is_err());
}

#[test]
fn test_parse_mkvps() {
    let contents = "AES NEW: empty 0x0000000000000000\n\
                    AES CUR: valid 0x1111111111111111\n\
                    APKA NEW: full 0xabcdef0123456789\n\
                    APKA CUR: valid 0x0123456789abcdef\n\
                    APKA OLD: empty 0x0000000000000000\n";

    let state = parse_apka_mkvps(contents).unwrap();
    assert_eq!(state.current, MasterKeyRegister::valid(0x0123456789abcdef));
    assert_eq!(state.new.state, RegisterState::Full);
    assert_eq!(state.new.mkvp, 0xabcdef0123456789);

    assert!(parse_apka_mkvps("AES CUR: valid 0x01").is_none());
}

#[test]
fn test_sysfs_directory() {
    let root = tempfile::tempdir().unwrap();
    let card = root.path().join("card03");
    let queue = card.join("03.0012");
    fs::create_dir_all(&queue).unwrap();
    fs::write(card.join("type"), "CEX7C\n").unwrap();
    fs::write(card.join("online"), "1\n").unwrap();
    fs::write(queue.join("online"), "1\n").unwrap();
    fs::write(queue.join("mkvps"), "APKA CUR: valid 0x00000000000000ff\n").unwrap();

    let directory = SysfsAdapterDirectory::new(root.path());
    let endpoint = ep(3, 0x12);

    assert_eq!(directory.adapter_family(endpoint), Some(AdapterFamily::Cca));
    assert!(directory.is_online(endpoint, AdapterFamily::Cca));
    assert!(!directory.is_online(endpoint, AdapterFamily::Ep11));
    assert_eq!(
        directory.master_key_state(endpoint).unwrap().current.mkvp,
        0xff
    );
    assert_eq!(directory.adapter_family(ep(3, 0x13)), None);

    fs::write(queue.join("online"), "0\n").unwrap();
    assert!(!directory.is_online(endpoint, AdapterFamily::Cca));
}
