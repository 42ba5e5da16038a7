//! FoE transfers against the simulated segment.

mod util;

use etherweave::{FoeStatus, error::Error};
use std::time::Duration;
use util::{SimConfig, master_with, wait_until};

fn scanned_master() -> (etherweave::MainDevice, util::BusHandle) {
    let (master, handle) = master_with(&[SimConfig::default()]);

    assert!(wait_until(Duration::from_secs(5), || {
        master.subdevice_count() == 1 && master.subdevice_info(0).is_ok()
    }));

    (master, handle)
}

#[test]
fn file_write_terminates_with_short_data_packet() {
    let (master, handle) = scanned_master();

    // Not an exact multiple of the block size, so the last DATA packet is short
    let file = (0..10_000u32)
        .map(|v| (v % 251) as u8)
        .collect::<Vec<u8>>();

    master
        .foe_write(0, "foo.bin", 0, &file, Some(Duration::from_secs(30)))
        .expect("FoE write");

    assert_eq!(
        handle.with_slave(0, |slave| slave.files["foo.bin"].clone()),
        file
    );
}

#[test]
fn file_read_round_trip() {
    let (master, handle) = scanned_master();

    let file = b"<EtherCATInfo>simulated</EtherCATInfo>".to_vec();

    handle.with_slave(0, |slave| {
        slave.files.insert("config.xml".to_string(), file.clone());
    });

    let read_back = master
        .foe_read(0, "config.xml", 0, None)
        .expect("FoE read");

    assert_eq!(read_back, file);
}

#[test]
fn missing_file_surfaces_error_code() {
    let (master, _handle) = scanned_master();

    let result = master.foe_read(0, "missing.bin", 0, None);

    match result {
        Err(Error::Foe(e)) => {
            assert_eq!(e.status, FoeStatus::Error);
            assert_eq!(e.code, 0x8001);
        }
        other => panic!("expected FoE error, got {:?}", other),
    }
}

#[test]
fn exact_block_multiple_write_completes() {
    let (master, handle) = scanned_master();

    // Exactly two full blocks: a terminating zero-length DATA packet is required
    let file = vec![0x5au8; 232];

    master
        .foe_write(0, "exact.bin", 0, &file, Some(Duration::from_secs(30)))
        .expect("FoE write");

    assert_eq!(
        handle.with_slave(0, |slave| slave.files["exact.bin"].clone()),
        file
    );
}
