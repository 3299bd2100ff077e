//! Discovery of one device over a simulated segment: the controller sends
//! Identify-All, a scripted RTU answers, and the cache ends up with exactly
//! one fully populated entry.

use penstock::time::timestamp_secs;
use pnio::codec::{self, EthernetHeader, Mac, ETHERTYPE_PROFINET};
use pnio::dcp::{self, Discovery, DiscoveryEvent};
use pnio::link::{Link, MemoryLink};
use std::net::Ipv4Addr;

const CONTROLLER_MAC: Mac = Mac([0x02, 0x00, 0x00, 0xAA, 0x00, 0x01]);
const RTU_MAC: Mac = Mac([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
const RTU_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 6, 21);

fn push_block(out: &mut Vec<u8>, option: u8, suboption: u8, payload: &[u8]) {
    out.push(option);
    out.push(suboption);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        out.push(0);
    }
}

/// The simulated RTU: answers an Identify request with its identity,
/// echoing the transaction id.
fn rtu_answer(request: &[u8]) -> Option<Vec<u8>> {
    let (eth, offset) = EthernetHeader::read_from(request).ok()?;

    if eth.ethertype != ETHERTYPE_PROFINET {
        return None;
    }
    if codec::get_u16(request, offset).ok()? != dcp::FRAME_ID_IDENTIFY_REQ {
        return None;
    }

    let xid = codec::get_u32(request, offset + 4).ok()?;

    let mut blocks = Vec::new();

    let mut ip_payload = vec![0, 0];
    ip_payload.extend_from_slice(&RTU_IP.octets());
    ip_payload.extend_from_slice(&Ipv4Addr::new(255, 255, 255, 0).octets());
    ip_payload.extend_from_slice(&Ipv4Addr::new(192, 168, 6, 1).octets());
    push_block(
        &mut blocks,
        dcp::option::IP,
        dcp::suboption::IP_PARAMETER,
        &ip_payload,
    );

    let mut name_payload = vec![0, 0];
    name_payload.extend_from_slice(b"rtu-ec3b");
    push_block(
        &mut blocks,
        dcp::option::DEVICE_PROPERTIES,
        dcp::suboption::DEV_NAME_OF_STATION,
        &name_payload,
    );

    let mut id_payload = vec![0, 0];
    id_payload.extend_from_slice(&0x0272u16.to_be_bytes());
    id_payload.extend_from_slice(&0x0C05u16.to_be_bytes());
    push_block(
        &mut blocks,
        dcp::option::DEVICE_PROPERTIES,
        dcp::suboption::DEV_DEVICE_ID,
        &id_payload,
    );

    push_block(
        &mut blocks,
        dcp::option::DEVICE_PROPERTIES,
        dcp::suboption::DEV_ROLE,
        &[0, 0, 0x01, 0x00],
    );

    let header = EthernetHeader {
        dst: eth.src,
        src: RTU_MAC,
        vlan: None,
        ethertype: ETHERTYPE_PROFINET,
    };

    let mut frame = vec![0u8; 14 + 2 + 10 + blocks.len()];
    let mut offset = header.write_to(&mut frame).unwrap();
    offset += codec::put_u16(&mut frame, offset, dcp::FRAME_ID_IDENTIFY_RES).unwrap();
    offset += codec::put_u8(&mut frame, offset, dcp::SERVICE_IDENTIFY).unwrap();
    offset += codec::put_u8(&mut frame, offset, dcp::SERVICE_TYPE_SUCCESS).unwrap();
    offset += codec::put_u32(&mut frame, offset, xid).unwrap();
    offset += codec::put_u16(&mut frame, offset, 0).unwrap();
    offset += codec::put_u16(&mut frame, offset, blocks.len() as u16).unwrap();
    codec::put_bytes(&mut frame, offset, &blocks).unwrap();

    Some(frame)
}

#[test]
fn discovery_of_one_device() {
    let mut link = MemoryLink::new();
    let mut discovery = Discovery::new(CONTROLLER_MAC, None);

    // Controller multicasts Identify-All.
    let request = discovery.identify_all().unwrap();
    assert_eq!(&request[0..6], &Mac::DCP_MULTICAST.0);
    link.send(&request).unwrap();

    // The simulated RTU on the segment answers.
    let response = rtu_answer(&link.sent[0]).expect("RTU must answer an identify request");
    link.inbound.push_back(response);

    let before = timestamp_secs();

    while let Some(frame) = link.recv().unwrap() {
        discovery.process_frame(&frame, timestamp_secs()).unwrap();
    }

    let after = timestamp_secs();

    // Exactly one cache entry with the full identity.
    assert_eq!(discovery.cache().len(), 1);

    let info = discovery.cache().get(&RTU_MAC).unwrap();
    assert_eq!(info.mac, RTU_MAC);
    assert_eq!(info.ip, Some(RTU_IP));
    assert_eq!(info.mask, Some(Ipv4Addr::new(255, 255, 255, 0)));
    assert_eq!(info.station_name.as_deref(), Some("rtu-ec3b"));
    assert_eq!(info.vendor_id, Some(0x0272));
    assert_eq!(info.device_id, Some(0x0C05));

    // Timestamps land within the current second.
    assert!(info.first_seen_secs >= before && info.first_seen_secs <= after);
    assert!(info.last_seen_secs >= before && info.last_seen_secs <= after);

    // The change feed reports the appearance.
    let changes: Vec<_> = discovery.changes().collect();
    assert_eq!(changes.len(), 1);
    assert!(matches!(changes[0], DiscoveryEvent::Appeared(mac) if mac == RTU_MAC));

    // Lookup by station name resolves to the same entry.
    assert!(discovery.cache().find_by_name("rtu-ec3b").is_some());
}

#[test]
fn identify_by_name_reaches_only_matching_station() {
    let mut discovery = Discovery::new(CONTROLLER_MAC, None);

    let request = discovery.identify_by_name("rtu-ec3b").unwrap();

    // The RTU answers a name-filtered request for its own name.
    assert!(rtu_answer(&request).is_some());
}
