//! Central task - scanning and connection initiation.
//!
//! Commands arrive from the orchestrator through [`CENTRAL_COMMANDS`].
//! While scanning, every advertisement is forwarded unfiltered; the
//! orchestrator's filter decides what to connect. Stopping the scan drops the
//! scan future, which cancels it in the SoftDevice. A stop that arrives
//! during a connection attempt cancels the attempt the same way and reports
//! it as failed.
//!
//! [`CENTRAL_COMMANDS`]: super::CENTRAL_COMMANDS

use ble_latency::config::{
    self, ms_to_conn_units, ms_to_sup_timeout_units, CONN_INTERVAL_MS, SUP_TIMEOUT_MS,
};
use core::pin::pin;

use ble_latency::{Address, ConnHandle};
use defmt::{info, warn, Format};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Receiver;
use heapless::Vec;
use nrf_softdevice::ble::central;
use nrf_softdevice::raw;
use nrf_softdevice::Softdevice;

use super::{
    post, to_address, to_sd_address, EventSender, LinkSender, StackEvent, CENTRAL_QUEUE_DEPTH,
};

#[derive(Clone, Copy, Format)]
pub enum CentralCommand {
    /// Connection interval for links opened from now on (ms).
    SetInterval(u32),
    StartScan,
    StopScan,
    Connect(Address),
}

fn conn_params(interval_ms: u32) -> raw::ble_gap_conn_params_t {
    let interval = ms_to_conn_units(interval_ms);
    raw::ble_gap_conn_params_t {
        min_conn_interval: interval,
        max_conn_interval: interval,
        slave_latency: config::BLE_SLAVE_LATENCY,
        conn_sup_timeout: ms_to_sup_timeout_units(SUP_TIMEOUT_MS),
    }
}

#[embassy_executor::task]
pub async fn central_task(
    sd: &'static Softdevice,
    commands: Receiver<'static, CriticalSectionRawMutex, CentralCommand, CENTRAL_QUEUE_DEPTH>,
    links: LinkSender,
    events: EventSender,
) -> ! {
    let mut params = conn_params(CONN_INTERVAL_MS);
    // Scanning resumes after a connection attempt until told to stop.
    let mut scanning = false;

    loop {
        let cmd = if scanning {
            match select(scan(sd, &events), commands.receive()).await {
                Either::First(()) => {
                    scanning = false;
                    continue;
                }
                Either::Second(cmd) => cmd,
            }
        } else {
            commands.receive().await
        };

        match cmd {
            CentralCommand::SetInterval(interval_ms) => {
                info!("Connection interval: {} ms", interval_ms);
                params = conn_params(interval_ms);
            }
            CentralCommand::StartScan => scanning = true,
            CentralCommand::StopScan => scanning = false,
            CentralCommand::Connect(address) => {
                let cancelled = {
                    let mut attempt = pin!(connect(sd, &address, params, &links, &events));
                    loop {
                        match select(attempt.as_mut(), commands.receive()).await {
                            Either::First(()) => break false,
                            Either::Second(CentralCommand::StopScan) => {
                                scanning = false;
                                break true;
                            }
                            Either::Second(CentralCommand::StartScan) => scanning = true,
                            Either::Second(CentralCommand::SetInterval(interval_ms)) => {
                                params = conn_params(interval_ms);
                            }
                            Either::Second(CentralCommand::Connect(_)) => {
                                warn!("Connection attempt already in progress");
                            }
                        }
                    }
                };
                // Dropping the attempt cancels it in the SoftDevice.
                if cancelled {
                    warn!("Discovery closed, connection attempt cancelled");
                    events.send(StackEvent::ConnectFailed).await;
                }
            }
        }
    }
}

/// Forward advertisements until the scan fails. Cancelled by dropping.
async fn scan(sd: &Softdevice, events: &EventSender) {
    let scan_config = central::ScanConfig::default();

    let result = central::scan(sd, &scan_config, |params| {
        let data =
            unsafe { core::slice::from_raw_parts(params.data.p_data, params.data.len as usize) };
        let address = nrf_softdevice::ble::Address::from_raw(params.peer_addr);

        let mut payload = Vec::new();
        // Legacy advertisements never exceed the buffer; drop anything longer.
        if payload.extend_from_slice(data).is_ok() {
            post(
                events,
                StackEvent::Advertisement {
                    address: to_address(&address),
                    payload,
                },
            );
        }
        None::<()>
    })
    .await;

    if result.is_err() {
        warn!("BLE scan ended with error");
    }
}

async fn connect(
    sd: &'static Softdevice,
    address: &Address,
    conn_params: raw::ble_gap_conn_params_t,
    links: &LinkSender,
    events: &EventSender,
) {
    let peer = to_sd_address(address);
    let whitelist = [&peer];
    let conn_cfg = central::ConnectConfig {
        scan_config: central::ScanConfig {
            whitelist: Some(&whitelist),
            ..Default::default()
        },
        conn_params,
        ..Default::default()
    };

    match central::connect(sd, &conn_cfg).await {
        Ok(conn) => match conn.handle() {
            Some(handle) => {
                info!("Connected to {}", ConnHandle(handle));
                links.send(conn).await;
            }
            None => events.send(StackEvent::ConnectFailed).await,
        },
        Err(_) => {
            warn!("Connection attempt failed");
            events.send(StackEvent::ConnectFailed).await;
        }
    }
}
