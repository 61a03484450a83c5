//! Mesh Proxy Simulator
//!
//! Simulates a mesh proxy node sending encrypted mesh traffic as Proxy PDUs
//! over UDP to the mesh-decode listener. Useful for testing without hardware.
//!
//! All traffic uses the published Mesh Profile sample keys. To decode it,
//! configure the listener with:
//!
//!   [[keys.network]]
//!   net_key = "7dd7364cd842ad18c17c2b820c84c3d6"
//!   app_key = "63964771734fbd76e3b40519d1d94a48"
//!   iv_index = "12345678"
//!
//!   [[keys.device]]
//!   dev_key = "9d6dd0e96eb25dc19a40ed9914f8f03f"
//!   address = "1201"
//!
//!   [[keys.label]]
//!   uuid = "0073e7e4d8b9440faf8415df4c56c0e1"
//!
//! Usage: cargo run --bin mesh-sim [server_addr]

use std::env;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{sleep, Duration};

use mesh_decode::mesh::beacon::SecureNetworkBeacon;
use mesh_decode::mesh::crypto::{self, Key128};
use mesh_decode::mesh::encoder::{AccessMessageBuilder, ControlMessageBuilder};
use mesh_decode::mesh::keys::{KeyClass, NetworkKeyRecord};
use mesh_decode::mesh::Bearer;
use mesh_decode::udp::protocol::{self, MessageType};

const NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";
const APP_KEY: &str = "63964771734fbd76e3b40519d1d94a48";
const DEV_KEY: &str = "9d6dd0e96eb25dc19a40ed9914f8f03f";
const LABEL: &str = "0073e7e4d8b9440faf8415df4c56c0e1";
const IV_INDEX: u32 = 0x12345678;

/// Proxy PDU payload limit (ATT MTU 23 minus opcode, handle and proxy header)
const PROXY_MTU: usize = 19;

fn key(hex_key: &str) -> anyhow::Result<Key128> {
    let bytes = hex::decode(hex_key)?;
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Key {} is not 16 bytes", hex_key))
}

/// A named message and the Proxy PDUs that carry it, in send order
struct Scenario {
    desc: &'static str,
    datagrams: Vec<Vec<u8>>,
}

fn proxy_datagrams(message_type: MessageType, data: &[u8]) -> Vec<Vec<u8>> {
    protocol::segment(message_type, data, PROXY_MTU)
        .iter()
        .map(|pdu| pdu.encode())
        .collect()
}

fn build_scenarios() -> anyhow::Result<Vec<Scenario>> {
    let network = NetworkKeyRecord::new(key(NET_KEY)?, IV_INDEX);
    let app_key = key(APP_KEY)?;
    let dev_key = key(DEV_KEY)?;
    let label = key(LABEL)?;
    let mut scenarios = Vec::new();

    // Friend Update control message (sample message #1)
    let friend_update = ControlMessageBuilder {
        opcode: 0x03,
        ttl: 0,
        seq: 0x000001,
        src: 0x1201,
        dst: 0xFFFD,
    }
    .build(&network, Bearer::Advertising, &hex::decode("4b50057e400000010000")?)?;
    scenarios.push(Scenario {
        desc: "Friend Update (unsegmented control)",
        datagrams: friend_update
            .iter()
            .flat_map(|pdu| proxy_datagrams(MessageType::NetworkPdu, pdu))
            .collect(),
    });

    // Config AppKey Add (sample message #6), segments delivered last-first
    let mut app_key_add = AccessMessageBuilder {
        class: KeyClass::Device,
        key: &dev_key,
        label: None,
        segmented: true,
        szmic: false,
        ttl: 4,
        seq: 0x3129AB,
        src: 0x0003,
        dst: 0x1201,
    }
    .build(&network, Bearer::Advertising, &hex::decode("0056341263964771734fbd76e3b40519d1d94a48")?)?;
    app_key_add.reverse();
    scenarios.push(Scenario {
        desc: "Config AppKey Add (device key, 2 segments out of order)",
        datagrams: app_key_add
            .iter()
            .flat_map(|pdu| proxy_datagrams(MessageType::NetworkPdu, pdu))
            .collect(),
    });

    // Vendor message to a virtual address
    let vendor = AccessMessageBuilder {
        class: KeyClass::Application,
        key: &app_key,
        label: Some(&label),
        segmented: false,
        szmic: false,
        ttl: 3,
        seq: 0x07080D,
        src: 0x1234,
        dst: crypto::virtual_address(&label),
    }
    .build(&network, Bearer::Advertising, &hex::decode("d50a0048656c6c6f")?)?;
    scenarios.push(Scenario {
        desc: "Vendor message to virtual address (application key)",
        datagrams: vendor
            .iter()
            .flat_map(|pdu| proxy_datagrams(MessageType::NetworkPdu, pdu))
            .collect(),
    });

    // Long access message with a 64-bit TransMIC
    let long_status = AccessMessageBuilder {
        class: KeyClass::Application,
        key: &app_key,
        label: None,
        segmented: true,
        szmic: true,
        ttl: 7,
        seq: 0x000200,
        src: 0x1201,
        dst: 0xC001,
    }
    .build(&network, Bearer::Advertising, b"\x82\x04temperature=21.5C humidity=40%")?;
    scenarios.push(Scenario {
        desc: "Long group message (segmented, 64-bit TransMIC)",
        datagrams: long_status
            .iter()
            .flat_map(|pdu| proxy_datagrams(MessageType::NetworkPdu, pdu))
            .collect(),
    });

    // Segmented control message
    let segmented_control = ControlMessageBuilder {
        opcode: 0x0A,
        ttl: 5,
        seq: 0x000100,
        src: 0x1201,
        dst: 0x0003,
    }
    .build(&network, Bearer::Advertising, &hex::decode("0102030405060708090a0b0c")?)?;
    scenarios.push(Scenario {
        desc: "Segmented control message",
        datagrams: segmented_control
            .iter()
            .flat_map(|pdu| proxy_datagrams(MessageType::NetworkPdu, pdu))
            .collect(),
    });

    let beacon = SecureNetworkBeacon::new(&network, false, false);
    scenarios.push(Scenario {
        desc: "Secure network beacon",
        datagrams: proxy_datagrams(MessageType::MeshBeacon, &beacon.encode()),
    });

    Ok(scenarios)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1680".to_string())
        .parse()?;

    println!("Mesh Proxy Simulator");
    println!("  Target: {}", server_addr);
    println!();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;

    for scenario in build_scenarios()? {
        println!("Sending: {}", scenario.desc);
        for datagram in &scenario.datagrams {
            println!("   {} bytes: {}", datagram.len(), hex::encode(datagram));
            socket.send_to(datagram, server_addr).await?;
            sleep(Duration::from_millis(200)).await;
        }
        println!();

        sleep(Duration::from_secs(1)).await;
    }

    println!("Simulation complete!");
    Ok(())
}
