//! ble-latency firmware - nRF52840 + SoftDevice S140.
//!
//! Task layout:
//!   - `softdevice_task`   - drives the SoftDevice event loop
//!   - `central_task`      - scanning and connection initiation
//!   - `link_task` (x N)   - one per connection; GATT server for responses
//!   - `scan_timer_task`   - one-shot discovery window
//!   - `button_task`       - start trigger
//!   - `orchestrator_task` - owns the test state machine
//!
//! Usage: `cargo run --release --features embedded`

#![no_std]
#![no_main]

mod button;
mod radio;

use defmt_rtt as _; // global logger
use embassy_nrf as _; // time driver
use panic_probe as _;

use ble_latency::config::{self, PROCESS_TICK_MS};
use ble_latency::{Error, Harness, StackHandler};
use defmt::{error, info, unwrap};
use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_nrf::gpio::Pin;
use embassy_nrf::interrupt::Priority;
use embassy_time::{Duration, Ticker};
use nrf_softdevice::{raw, Softdevice};
use static_cell::StaticCell;

use crate::radio::link::Server;
use crate::radio::{SoftdeviceStack, StackEvent, CENTRAL_COMMANDS, EVENTS, NEW_LINKS};

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

#[embassy_executor::task]
async fn orchestrator_task() -> ! {
    let events = EVENTS.receiver();
    let mut harness = Harness::default();
    let mut stack = SoftdeviceStack::new();
    let mut ticker = Ticker::every(Duration::from_millis(PROCESS_TICK_MS));

    if let Err(e) = harness.on_ready(&mut stack) {
        halt(e);
    }

    loop {
        match select(events.receive(), ticker.next()).await {
            Either::First(event) => {
                if let StackEvent::Opened { handle, conn } = &event {
                    stack.attach(*handle, conn.clone());
                }
                let result = harness.on_event(&mut stack, event.as_event());
                if let StackEvent::Closed(handle) = &event {
                    stack.detach(*handle);
                }
                if let Err(e) = result {
                    halt(e);
                }
            }
            Either::Second(()) => {
                if let Err(e) = harness.on_tick(&mut stack) {
                    halt(e);
                }
            }
        }
    }
}

/// A rejected stack command invalidates the run.
fn halt(e: Error) -> ! {
    error!("Fatal: {} (status {:#x})", e, e.status_code());
    defmt::panic!("Test run aborted");
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("ble-latency starting");

    // The SoftDevice reserves interrupt priorities 0, 1 and 4.
    let mut nrf_config = embassy_nrf::config::Config::default();
    nrf_config.gpiote_interrupt_priority = Priority::P2;
    nrf_config.time_interrupt_priority = Priority::P2;
    let p = embassy_nrf::init(nrf_config);

    let sd = initialize_sd();

    static SERVER: StaticCell<Server> = StaticCell::new();
    let server = SERVER.init(unwrap!(Server::new(sd)));
    let sd: &'static Softdevice = sd;

    unwrap!(spawner.spawn(softdevice_task(sd)));
    unwrap!(spawner.spawn(radio::central::central_task(
        sd,
        CENTRAL_COMMANDS.receiver(),
        NEW_LINKS.sender(),
        EVENTS.sender(),
    )));
    for _ in 0..config::MAX_CONNECTIONS {
        unwrap!(spawner.spawn(radio::link::link_task(
            server,
            NEW_LINKS.receiver(),
            EVENTS.sender(),
        )));
    }
    unwrap!(spawner.spawn(radio::scan_timer_task(EVENTS.sender())));
    // Button 1 on the nRF52840-DK.
    unwrap!(spawner.spawn(button::button_task(p.P0_11.degrade(), EVENTS.sender())));
    unwrap!(spawner.spawn(orchestrator_task()));
}

fn initialize_sd() -> &'static mut Softdevice {
    let sd_config = nrf_softdevice::Config {
        clock: Some(raw::nrf_clock_lf_cfg_t {
            source: raw::NRF_CLOCK_LF_SRC_XTAL as u8,
            rc_ctiv: 0,
            rc_temp_ctiv: 0,
            accuracy: raw::NRF_CLOCK_LF_ACCURACY_20_PPM as u8,
        }),
        conn_gap: Some(raw::ble_gap_conn_cfg_t {
            conn_count: config::MAX_CONNECTIONS as u8,
            event_length: 6,
        }),
        conn_gatt: Some(raw::ble_gatt_conn_cfg_t { att_mtu: 23 }),
        gatts_attr_tab_size: Some(raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: raw::BLE_GATTS_ATTR_TAB_SIZE_DEFAULT,
        }),
        gap_role_count: Some(raw::ble_gap_cfg_role_count_t {
            adv_set_count: 0,
            periph_role_count: 0,
            central_role_count: config::MAX_CONNECTIONS as u8,
            central_sec_count: 0,
            _bitfield_1: raw::ble_gap_cfg_role_count_t::new_bitfield_1(0),
        }),
        ..Default::default()
    };

    Softdevice::enable(&sd_config)
}
