//! BLE transport interface stub.
//!
//! Out of scope beyond presenting the interface (§1 Non-goals): no GATT
//! service is implemented. `spawn` returns a handle whose command channel is
//! drained into nothing and whose event channel never produces anything,
//! so a supervisor can wire a BLE slot into its transport table today and get
//! a real implementation later without changing any other code.

use crate::{TransportContext, TransportError, TransportHandle};
use atmosphere_types::TransportKind;
use tokio::sync::mpsc;

pub fn spawn(_ctx: TransportContext) -> Result<TransportHandle, TransportError> {
    let (command_tx, mut command_rx) = mpsc::channel(16);
    let (_event_tx, event_rx) = mpsc::channel(1);

    tokio::spawn(async move { while command_rx.recv().await.is_some() {} });

    Ok(TransportHandle {
        name: "ble",
        kind: TransportKind::Ble,
        commands: command_tx,
        events: event_rx,
    })
}
