//! Link tasks - one per connection slot.
//!
//! A link task picks up a freshly opened connection, announces it, and runs
//! the local GATT server on it until the peer goes away. The peer answers a
//! test write by writing to our response characteristic; each such write is
//! forwarded as an attribute-value event.

use ble_latency::config::ATT_VALUE_MAX;
use ble_latency::ConnHandle;
use defmt::{debug, info};
use heapless::Vec;
use nrf_softdevice::ble::gatt_server;
use nrf_softdevice::{gatt_server, gatt_service};

use super::{post, EventSender, LinkReceiver, StackEvent};

/// Service the peer writes its response to.
#[gatt_service(uuid = "cccc")]
pub struct ResponseService {
    #[characteristic(uuid = "cc01", write, write_without_response)]
    response: Vec<u8, ATT_VALUE_MAX>,
}

#[gatt_server]
pub struct Server {
    response: ResponseService,
}

#[embassy_executor::task(pool_size = ble_latency::config::MAX_CONNECTIONS)]
pub async fn link_task(server: &'static Server, links: LinkReceiver, events: EventSender) -> ! {
    loop {
        let conn = links.receive().await;
        // Already gone: nothing to announce.
        let Some(raw) = conn.handle() else {
            continue;
        };
        let handle = ConnHandle(raw);
        events
            .send(StackEvent::Opened {
                handle,
                conn: conn.clone(),
            })
            .await;

        let reason = gatt_server::run(&conn, server, |e| match e {
            ServerEvent::Response(ResponseServiceEvent::ResponseWrite(value)) => {
                debug!("Response from {}: {} bytes", handle, value.len());
                post(&events, StackEvent::AttributeValue { handle, value });
            }
        })
        .await;

        info!("Link {} closed: {:?}", handle, reason);
        events.send(StackEvent::Closed(handle)).await;
    }
}
