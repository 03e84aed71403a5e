//! In-memory GATT server and GAP peripheral.
//!
//! Centrals are represented by a bounded tokio channel that receives every
//! notification sent to them. A full channel fails the notify the way a
//! congested link does. The `central_*` methods play the remote side
//! and return the [`RadioEvent`] the stack would raise, which the caller
//! feeds to [`crate::channel::CommandChannel::handle_event`].

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tracing::trace;

use crate::channel::{
    Advertisement, AttrHandle, BleRadio, CharacteristicProps, ConnHandle, RadioError, RadioEvent,
    ServiceDef, ServiceHandles,
};
use crate::protocol::Uuid128;

/// ATT maximum attribute value length.
const MAX_ATTRIBUTE_LEN: usize = 512;

/// Notifications a central may have outstanding before further ones fail.
pub const CENTRAL_OUTBOX_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingState {
    pub interval_us: u32,
    pub adv_data: Vec<u8>,
    pub scan_response: Vec<u8>,
}

#[derive(Debug)]
struct Attribute {
    uuid: Uuid128,
    props: CharacteristicProps,
    value: Vec<u8>,
}

#[derive(Debug)]
struct Central {
    outbox: Sender<Vec<u8>>,
    failing: bool,
}

#[derive(Debug, Default)]
struct RadioState {
    attributes: BTreeMap<AttrHandle, Attribute>,
    next_handle: AttrHandle,
    advertising: Option<AdvertisingState>,
    centrals: BTreeMap<ConnHandle, Central>,
    next_conn: ConnHandle,
    fail_registration: bool,
}

#[derive(Debug, Default)]
pub struct SimRadio {
    state: Mutex<RadioState>,
}

impl SimRadio {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RadioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `register_service` call fail.
    pub fn fail_registration(&self, fail: bool) {
        self.state().fail_registration = fail;
    }

    #[must_use]
    pub fn is_advertising(&self) -> bool {
        self.state().advertising.is_some()
    }

    #[must_use]
    pub fn advertising(&self) -> Option<AdvertisingState> {
        self.state().advertising.clone()
    }

    #[must_use]
    pub fn attribute_value(&self, handle: AttrHandle) -> Option<Vec<u8>> {
        self.state().attributes.get(&handle).map(|attr| attr.value.clone())
    }

    #[must_use]
    pub fn find_handle(&self, uuid: Uuid128) -> Option<AttrHandle> {
        self.state()
            .attributes
            .iter()
            .find(|(_, attr)| attr.uuid == uuid)
            .map(|(handle, _)| *handle)
    }

    #[must_use]
    pub fn central_count(&self) -> usize {
        self.state().centrals.len()
    }

    /// A central links up. Returns its handle and the connect event.
    pub fn connect_central(&self, outbox: Sender<Vec<u8>>) -> (ConnHandle, RadioEvent) {
        let mut state = self.state();
        let conn = state.next_conn;
        state.next_conn = state.next_conn.wrapping_add(1);
        state.centrals.insert(
            conn,
            Central {
                outbox,
                failing: false,
            },
        );
        (conn, RadioEvent::CentralConnect { conn })
    }

    pub fn disconnect_central(&self, conn: ConnHandle) -> RadioEvent {
        self.state().centrals.remove(&conn);
        RadioEvent::CentralDisconnect { conn }
    }

    /// A central writes `value` to `handle`.
    ///
    /// # Errors
    ///
    /// [`RadioError::NotConnected`] for an unknown central, or
    /// [`RadioError::Rejected`] when the attribute is not writable or the value
    /// is longer than an ATT attribute.
    pub fn central_write(&self, conn: ConnHandle, handle: AttrHandle, value: &[u8]) -> Result<RadioEvent, RadioError> {
        let mut state = self.state();
        if !state.centrals.contains_key(&conn) {
            return Err(RadioError::NotConnected(conn));
        }
        let attr = state
            .attributes
            .get_mut(&handle)
            .ok_or(RadioError::UnknownHandle(handle))?;
        if !attr.props.write || value.len() > MAX_ATTRIBUTE_LEN {
            return Err(RadioError::Rejected);
        }
        attr.value = value.to_vec();
        Ok(RadioEvent::GattsWrite {
            conn,
            value_handle: handle,
        })
    }

    /// Notifications to `conn` fail while set, as with a peer that stopped acknowledging.
    pub fn set_notify_failure(&self, conn: ConnHandle, failing: bool) {
        if let Some(central) = self.state().centrals.get_mut(&conn) {
            central.failing = failing;
        }
    }
}

impl BleRadio for SimRadio {
    fn register_service(&self, service: &ServiceDef<'_>) -> Result<ServiceHandles, RadioError> {
        let mut state = self.state();
        if state.fail_registration {
            return Err(RadioError::Rejected);
        }

        // service declaration, then declaration + value per characteristic
        state.next_handle += 1;
        let mut handles = ServiceHandles::new();
        for characteristic in service.characteristics {
            state.next_handle += 2;
            let handle = state.next_handle;
            handles.push(handle).map_err(|_| RadioError::Rejected)?;
            state.attributes.insert(
                handle,
                Attribute {
                    uuid: characteristic.uuid,
                    props: characteristic.props,
                    value: Vec::new(),
                },
            );
        }
        Ok(handles)
    }

    fn gatts_read(&self, handle: AttrHandle, buf: &mut [u8]) -> Result<usize, RadioError> {
        let state = self.state();
        let attr = state
            .attributes
            .get(&handle)
            .ok_or(RadioError::UnknownHandle(handle))?;
        let target = buf
            .get_mut(..attr.value.len())
            .ok_or(RadioError::BufferTooSmall)?;
        target.copy_from_slice(&attr.value);
        Ok(attr.value.len())
    }

    fn gatts_write(&self, handle: AttrHandle, value: &[u8]) -> Result<(), RadioError> {
        let mut state = self.state();
        let attr = state
            .attributes
            .get_mut(&handle)
            .ok_or(RadioError::UnknownHandle(handle))?;
        attr.value = value.to_vec();
        Ok(())
    }

    fn gatts_notify(&self, conn: ConnHandle, handle: AttrHandle) -> Result<(), RadioError> {
        let state = self.state();
        let central = state
            .centrals
            .get(&conn)
            .ok_or(RadioError::NotConnected(conn))?;
        let attr = state
            .attributes
            .get(&handle)
            .ok_or(RadioError::UnknownHandle(handle))?;
        if central.failing || !attr.props.notify {
            return Err(RadioError::Rejected);
        }
        central.outbox.try_send(attr.value.clone()).map_err(|e| match e {
            TrySendError::Full(_) => RadioError::Rejected,
            TrySendError::Closed(_) => RadioError::NotConnected(conn),
        })?;
        trace!(conn, handle, len = attr.value.len(), "notified");
        Ok(())
    }

    fn gap_advertise(&self, advertisement: Option<&Advertisement<'_>>) -> Result<(), RadioError> {
        self.state().advertising = advertisement.map(|adv| AdvertisingState {
            interval_us: adv.interval_us,
            adv_data: adv.adv_data.to_vec(),
            scan_response: adv.scan_response.to_vec(),
        });
        Ok(())
    }
}
