//! Topology detection and bus scan behaviour.

mod util;

use std::time::Duration;
use util::{SimConfig, master_with, sii_crc8, wait_until};

#[test]
fn empty_bus_stays_idle() {
    let (master, _handle) = master_with(&[]);

    // Give the idle thread a few cycles to run its broadcast
    assert!(wait_until(Duration::from_secs(1), || {
        master.status().tx_frames > 3
    }));

    assert_eq!(master.subdevice_count(), 0);
    assert!(!master.status().activated);
    assert!(master.subdevice_info(0).is_err());
}

#[test]
fn single_subdevice_gets_station_address_one() {
    let (master, _handle) = master_with(&[SimConfig::default()]);

    assert!(wait_until(Duration::from_secs(5), || {
        master.subdevice_count() == 1 && master.subdevice_info(0).is_ok()
    }));

    // Verified on the wire, not just in the master's bookkeeping
    let address = master
        .register_read(0, 0x0010, 2)
        .expect("register read of configured station address");

    assert_eq!(address, vec![0x01, 0x00]);

    let info = master.subdevice_info(0).expect("scanned SubDevice");

    assert_eq!(info.configured_address, 1);
    assert_eq!(info.identity.vendor_id, 0x0000_0002);
    assert_eq!(info.identity.product_id, 0x07d4_3052);
    assert_eq!(info.name.as_deref(), Some("SIM2004"));
}

#[test]
fn scan_parses_alias_and_mailbox_protocols() {
    let (master, _handle) = master_with(&[SimConfig {
        alias: 0xbeef,
        ..SimConfig::default()
    }]);

    assert!(wait_until(Duration::from_secs(5), || {
        master.subdevice_count() == 1 && master.subdevice_info(0).is_ok()
    }));

    let info = master.subdevice_info(0).unwrap();

    assert_eq!(info.alias, 0xbeef);
    assert!(info
        .mailbox_protocols
        .contains(etherweave::MailboxProtocols::COE | etherweave::MailboxProtocols::FOE));
}

#[test]
fn alias_write_preserves_sii_checksum() {
    let (master, handle) = master_with(&[SimConfig::default()]);

    assert!(wait_until(Duration::from_secs(5), || {
        master.subdevice_count() == 1 && master.subdevice_info(0).is_ok()
    }));

    master.write_alias(0, 0x1234).expect("alias write");

    let eeprom = handle.with_slave(0, |slave| slave.eeprom.clone());

    // Word 4 carries the new alias
    assert_eq!(&eeprom[8..10], &[0x34, 0x12]);

    // Byte 14 is the checksum over bytes 0..13 with the ETG polynomial
    assert_eq!(eeprom[14], sii_crc8(&eeprom));
}

#[test]
fn reboot_request_runs_the_reset_sequence() {
    let (master, handle) = master_with(&[SimConfig::default()]);

    assert!(wait_until(Duration::from_secs(5), || {
        master.subdevice_count() == 1 && master.subdevice_info(0).is_ok()
    }));

    master.reboot(0).expect("reboot request");

    assert_eq!(handle.with_slave(0, |slave| slave.reset_count), 1);
}
