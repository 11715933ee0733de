//! Start button with async debouncing.
//!
//! Active-low with internal pull-up. Every debounced press queues a
//! start trigger; the orchestrator ignores it outside `AwaitingStart`.

use ble_latency::config::BUTTON_DEBOUNCE_MS;
use defmt::info;
use embassy_nrf::gpio::{AnyPin, Input, Pull};
use embassy_time::{Duration, Timer};

use crate::radio::{EventSender, StackEvent};

/// Waits for the pin to go low, debounces, sends the trigger, then waits for
/// release before repeating.
#[embassy_executor::task]
pub async fn button_task(pin: AnyPin, events: EventSender) -> ! {
    let mut btn = Input::new(pin, Pull::Up);

    loop {
        btn.wait_for_falling_edge().await;
        Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;

        if btn.is_low() {
            info!("Start button pressed");
            events.send(StackEvent::StartTrigger).await;

            // Wait for release to avoid repeat triggers.
            btn.wait_for_rising_edge().await;
            Timer::after(Duration::from_millis(BUTTON_DEBOUNCE_MS)).await;
        }
    }
}
