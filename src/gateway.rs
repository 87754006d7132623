// Outbound KNX gateway
//
// Routes commanded values: external addresses are transcoded to their DPT
// and handed to the KNX/IP driver, internal addresses loop straight back
// through the address bus. No retries here; retrying is a block-level
// concern. The driver itself lives outside the core — we only consume the
// trait below plus an inbound frame channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::address::{AddressKey, GroupAddress};
use crate::bus::AddressBus;
use crate::dpt;
use crate::telegram::Telegram;
use crate::types::{Error, Origin, Result};
use crate::value::Value;

/// A group write arriving from the KNX bus.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub address: GroupAddress,
    pub payload: Vec<u8>,
}

/// A group write leaving for the KNX bus.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub address: GroupAddress,
    pub payload: Vec<u8>,
}

/// The duplex KNX/IP driver seam. The tunnelling implementation is an
/// external collaborator; the core only ever calls this.
pub trait KnxDriver: Send + Sync {
    fn send_group_write(&self, frame: OutboundFrame) -> Result<()>;
}

/// Driver used when no KNX gateway is configured: external writes fail,
/// which shows up as failed telegrams.
pub struct NullDriver;

impl KnxDriver for NullDriver {
    fn send_group_write(&self, frame: OutboundFrame) -> Result<()> {
        Err(Error::Gateway(format!(
            "no KNX gateway configured, dropping write to {}",
            frame.address
        )))
    }
}

/// Driver backed by a channel. Used by tests and by loopback setups where
/// another task owns the socket.
pub struct ChannelDriver {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl ChannelDriver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl KnxDriver for ChannelDriver {
    fn send_group_write(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| Error::Gateway("KNX driver channel closed".to_string()))
    }
}

pub struct Gateway {
    bus: Arc<AddressBus>,
    driver: Arc<dyn KnxDriver>,
}

impl Gateway {
    pub fn new(bus: Arc<AddressBus>, driver: Arc<dyn KnxDriver>) -> Self {
        Self { bus, driver }
    }

    /// Send a commanded value to an address. External keys go to the driver
    /// first and reach the bus only when the driver accepted the frame; a
    /// rejected frame is recorded as a failed telegram and returned as an
    /// error. Internal keys write straight to the bus.
    pub fn send(&self, key: &AddressKey, value: Value, origin: Origin) -> Result<Option<Telegram>> {
        match key.group() {
            Some(group) => {
                let record = self.bus.get(key)?;
                let payload = match record.dpt.as_deref() {
                    Some(dpt) => dpt::encode(&value, dpt)?,
                    None => dpt::encode_untyped(&value),
                };
                debug!(address = %key, payload = ?payload, "forwarding to KNX driver");
                if let Err(e) = self.driver.send_group_write(OutboundFrame {
                    address: group,
                    payload,
                }) {
                    self.bus.record_failure(key, &value, origin);
                    return Err(e);
                }
                self.bus.write(key, value, origin)
            }
            None => self.bus.write(key, value, origin),
        }
    }
}
