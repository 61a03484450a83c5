pub mod protocol;

use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::mesh::beacon;
use crate::mesh::keys::KeyStore;
use crate::mesh::pipeline::Decoder;
use crate::mesh::Bearer;
use crate::report::DecodedPacket;
use protocol::{MessageType, ProxyPdu, ProxySar};

/// Decoding state for datagrams from every peer
pub struct ProxyIngest {
    sar: ProxySar<SocketAddr>,
    decoder: Decoder,
    /// Bearer assumed for network PDUs
    bearer: Bearer,
}

impl ProxyIngest {
    pub fn new(keys: KeyStore, bearer: Bearer) -> Self {
        Self {
            sar: ProxySar::new(),
            decoder: Decoder::new(keys),
            bearer,
        }
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Handle one datagram. Returns a report once a full message is available.
    pub fn handle_datagram(&mut self, peer: SocketAddr, data: &[u8]) -> Option<DecodedPacket> {
        let source = peer.to_string();

        let pdu = match ProxyPdu::parse(data) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("Failed to parse proxy PDU from {}: {}", peer, e);
                return Some(DecodedPacket::undecodable(data, self.bearer, &source, e));
            }
        };

        let (message_type, message) = match self.sar.push(&peer, pdu) {
            Ok(Some(complete)) => complete,
            Ok(None) => {
                debug!("Waiting for more proxy segments from {}", peer);
                return None;
            }
            Err(e) => {
                warn!("Dropping proxy segment from {}: {}", peer, e);
                return None;
            }
        };

        match message_type {
            MessageType::NetworkPdu => {
                let outcome = self.decoder.decode(&message, self.bearer);
                Some(DecodedPacket::from_outcome(&outcome, &message, self.bearer, &source))
            }
            MessageType::ProxyConfiguration => {
                let outcome = self.decoder.decode_proxy_configuration(&message);
                Some(DecodedPacket::from_outcome(&outcome, &message, Bearer::Proxy, &source))
            }
            MessageType::MeshBeacon => Some(match beacon::parse(&message) {
                Ok(parsed) => DecodedPacket::from_beacon(&parsed, self.decoder.keys(), &message, self.bearer, &source),
                Err(e) => DecodedPacket::undecodable(&message, self.bearer, &source, e),
            }),
            MessageType::Provisioning => {
                debug!("Ignoring {} byte provisioning PDU from {}", message.len(), peer);
                None
            }
        }
    }
}

/// Receive one datagram and decode it
pub async fn recv_one(
    socket: &UdpSocket,
    ingest: &mut ProxyIngest,
    buf: &mut [u8],
) -> anyhow::Result<Option<DecodedPacket>> {
    let (len, src) = socket.recv_from(buf).await?;
    debug!("Received {} bytes from {}", len, src);
    Ok(ingest.handle_datagram(src, &buf[..len]))
}

/// Run the proxy PDU UDP server
///
/// Each decode report is sent to `report_tx`.
pub async fn run_server(config: &Config, keys: KeyStore, report_tx: mpsc::Sender<DecodedPacket>) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(&config.udp.bind).await?;
    info!("UDP server listening on {}", config.udp.bind);

    let mut ingest = ProxyIngest::new(keys, config.decoder.bearer());
    let mut buf = vec![0u8; 65535];

    loop {
        match recv_one(&socket, &mut ingest, &mut buf).await {
            Ok(Some(report)) => {
                if let Err(e) = report_tx.send(report).await {
                    error!("Report channel closed: {}", e);
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!("UDP receive failed: {}", e);
            }
        }
    }
}
