use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use rppal::gpio::{Gpio, InputPin, Level, Trigger};
use tracing::{info, trace};

use crate::{common::Event, mailbox::Mailbox, user_config::EncoderPins};

const BUTTON_DEBOUNCE: Duration = Duration::from_millis(200);

/**
 * Direction per transition, indexed by (current state << 2 | previous state)
 * where a state is (A << 1 | B). Only transitions that land on 00 or 11
 * count.
 */
const TRANSITIONS: [i8; 16] = [0, 1, -1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, -1, 1, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Channel {
    A,
    B,
}

#[derive(Debug, Default)]
pub(crate) struct QuadratureDecoder {
    level_a: u8,
    level_b: u8,
    last_channel: Option<Channel>,
    previous_state: u8,
}

#[derive(Debug, Default)]
pub(crate) struct ButtonDebouncer {
    last_press: Option<Instant>,
}

/**
 * Keeps the interrupt registrations alive. Dropping this stops input.
 */
pub(crate) struct RotaryEncoder {
    _pin_a: InputPin,
    _pin_b: InputPin,
    _button: InputPin,
}

impl QuadratureDecoder {
    /**
     * Feeds one edge. Returns +1/-1 when the edge completes a step.
     */
    pub(crate) fn edge(&mut self, channel: Channel, level: Level) -> Option<i32> {
        let bit = match level {
            Level::Low => 0,
            Level::High => 1,
        };
        match channel {
            Channel::A => self.level_a = bit,
            Channel::B => self.level_b = bit,
        }

        // Two edges in a row on the same pin is contact bounce.
        if self.last_channel == Some(channel) {
            return None;
        }
        self.last_channel = Some(channel);

        let state = self.level_a << 1 | self.level_b;
        let direction = TRANSITIONS[(state << 2 | self.previous_state) as usize];
        self.previous_state = state;

        match direction {
            0 => None,
            d => Some(d as i32),
        }
    }
}

impl ButtonDebouncer {
    /**
     * Returns true for a press that should be reported. Releases are
     * ignored and so is anything within the debounce window.
     */
    pub(crate) fn edge(&mut self, level: Level, now: Instant) -> bool {
        if let Some(last) = self.last_press {
            if now.duration_since(last) < BUTTON_DEBOUNCE {
                return false;
            }
        }
        self.last_press = Some(now);

        // Pull-up: pressed is low.
        level == Level::Low
    }
}

/**
 * Sets up interrupts on the encoder pins. The callbacks run on rppal's
 * interrupt threads and only ever post to the mailbox without blocking.
 */
pub(crate) fn start_encoder(
    gpio: &Gpio,
    pins: &EncoderPins,
    mailbox: Arc<Mailbox>,
) -> Result<RotaryEncoder, rppal::gpio::Error> {
    let mut pin_a = gpio.get(pins.a)?.into_input_pullup();
    let mut pin_b = gpio.get(pins.b)?.into_input_pullup();
    let mut button = gpio.get(pins.button)?.into_input_pullup();

    let decoder = Arc::new(Mutex::new(QuadratureDecoder::default()));
    for (pin, channel) in [(&mut pin_a, Channel::A), (&mut pin_b, Channel::B)] {
        let decoder = decoder.clone();
        let mailbox = mailbox.clone();
        pin.set_async_interrupt(Trigger::Both, move |level: Level| {
            let step = decoder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .edge(channel, level);
            if let Some(step) = step {
                if !mailbox.post(Event::Pulse(step)) {
                    trace!("Dropped pulse {}", step);
                }
            }
        })?;
    }

    let mut debouncer = ButtonDebouncer::default();
    button.set_async_interrupt(Trigger::Both, move |level: Level| {
        if debouncer.edge(level, Instant::now()) && !mailbox.post(Event::Button) {
            trace!("Dropped button press");
        }
    })?;

    info!(
        "Rotary encoder on GPIO {}/{}, button on GPIO {}",
        pins.a, pins.b, pins.button
    );
    Ok(RotaryEncoder {
        _pin_a: pin_a,
        _pin_b: pin_b,
        _button: button,
    })
}
