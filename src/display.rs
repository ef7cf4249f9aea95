use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use rppal::gpio::{Gpio, Level, OutputPin};
use tracing::warn;

use crate::user_config::LcdPins;

pub(crate) const LCD_ROWS: usize = 2;
pub(crate) const LCD_COLS: usize = 16;
pub(crate) const MAX_BRIGHTNESS: u8 = 255;

/** Full contents of the LCD, one string per row. */
pub(crate) type Screen = [String; LCD_ROWS];

/**
 * Synchronous text display with a dimmable backlight.
 */
pub(crate) trait Display: Send {
    fn clear(&mut self);
    fn write(&mut self, row: usize, col: usize, text: &str);
    fn set_backlight(&mut self, level: u8);
}

/**
 * The one display, shared by the dispatcher and the worker threads.
 * Every call holds the lock for its whole duration so writes from different
 * threads never interleave mid-screen.
 */
#[derive(Clone)]
pub(crate) struct SharedDisplay {
    inner: Arc<Mutex<Box<dyn Display>>>,
}

impl SharedDisplay {
    pub(crate) fn new<D: Display + 'static>(display: D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(display))),
        }
    }

    /**
     * Overwrites both rows. Rows are padded to the panel width instead of
     * clearing first, which avoids a visible flicker on every refresh.
     */
    pub(crate) fn show(&self, screen: &Screen) {
        let mut display = self._lock();
        for (row, text) in screen.iter().enumerate() {
            display.write(row, 0, &fit_row(text));
        }
    }

    pub(crate) fn clear(&self) {
        self._lock().clear();
    }

    pub(crate) fn set_backlight(&self, level: u8) {
        self._lock().set_backlight(level);
    }

    fn _lock(&self) -> MutexGuard<'_, Box<dyn Display>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/**
 * Pads or truncates to exactly one LCD row.
 */
pub(crate) fn fit_row(text: &str) -> String {
    let mut row: String = text.chars().take(LCD_COLS).collect();
    while row.chars().count() < LCD_COLS {
        row.push(' ');
    }
    row
}

//////////////////////////// HD44780 Driver Start ////////////////////////////
const BACKLIGHT_PWM_HZ: f64 = 200.0;
const CMD_CLEAR: u8 = 0x01;
const CMD_ENTRY_MODE_INCREMENT: u8 = 0x06;
const CMD_DISPLAY_OFF: u8 = 0x08;
const CMD_DISPLAY_ON: u8 = 0x0C;
const CMD_FUNCTION_SET_4BIT_2LINE: u8 = 0x28;
const CMD_SET_DDRAM_ADDR: u8 = 0x80;
const ROW_OFFSETS: [u8; LCD_ROWS] = [0x00, 0x40];

/**
 * 16x2 HD44780 character LCD wired in 4-bit mode, with the backlight on a
 * separate pin driven by software PWM.
 */
pub(crate) struct Hd44780Display {
    rs: OutputPin,
    en: OutputPin,
    /** D4, D5, D6, D7 */
    data: [OutputPin; 4],
    backlight: OutputPin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Register {
    Command,
    Data,
}

impl Hd44780Display {
    pub(crate) fn new(gpio: &Gpio, pins: &LcdPins) -> Result<Self, rppal::gpio::Error> {
        let mut display = Self {
            rs: gpio.get(pins.rs)?.into_output_low(),
            en: gpio.get(pins.en)?.into_output_low(),
            data: [
                gpio.get(pins.d4)?.into_output_low(),
                gpio.get(pins.d5)?.into_output_low(),
                gpio.get(pins.d6)?.into_output_low(),
                gpio.get(pins.d7)?.into_output_low(),
            ],
            backlight: gpio.get(pins.backlight)?.into_output_low(),
        };
        display._initialize();
        Ok(display)
    }

    /**
     * Power-on sequence from the HD44780 datasheet: three 8-bit function
     * sets to get a known state, then switch to 4-bit mode.
     */
    fn _initialize(&mut self) {
        // Wait for Vcc to settle
        thread::sleep(Duration::from_millis(50));
        self.rs.set_low();

        self._write_nibble(0x3);
        thread::sleep(Duration::from_millis(5));
        self._write_nibble(0x3);
        thread::sleep(Duration::from_micros(200));
        self._write_nibble(0x3);
        thread::sleep(Duration::from_micros(200));
        self._write_nibble(0x2);
        thread::sleep(Duration::from_millis(5));

        self._send(CMD_FUNCTION_SET_4BIT_2LINE, Register::Command);
        self._send(CMD_DISPLAY_OFF, Register::Command);
        self._send(CMD_CLEAR, Register::Command);
        self._send(CMD_ENTRY_MODE_INCREMENT, Register::Command);
        self._send(CMD_DISPLAY_ON, Register::Command);
    }

    fn _pulse_enable(&mut self) {
        self.en.set_high();
        thread::sleep(Duration::from_micros(1));
        self.en.set_low();
    }

    fn _write_nibble(&mut self, nibble: u8) {
        for (bit, pin) in self.data.iter_mut().enumerate() {
            pin.write(if (nibble >> bit) & 1 == 1 {
                Level::High
            } else {
                Level::Low
            });
        }
        self._pulse_enable();
    }

    fn _send(&mut self, byte: u8, register: Register) {
        self.rs.write(match register {
            Register::Command => Level::Low,
            Register::Data => Level::High,
        });
        self._write_nibble(byte >> 4);
        self._write_nibble(byte & 0x0F);

        // Clear is the only slow instruction (1.52ms), everything else
        // finishes in ~40us.
        thread::sleep(if byte == CMD_CLEAR && register == Register::Command {
            Duration::from_millis(2)
        } else {
            Duration::from_micros(50)
        });
    }
}

impl Display for Hd44780Display {
    fn clear(&mut self) {
        self._send(CMD_CLEAR, Register::Command);
    }

    fn write(&mut self, row: usize, col: usize, text: &str) {
        if row >= LCD_ROWS || col >= LCD_COLS {
            return;
        }
        self._send(
            CMD_SET_DDRAM_ADDR | (ROW_OFFSETS[row] + col as u8),
            Register::Command,
        );
        for c in text.chars().take(LCD_COLS - col) {
            // The controller ROM only matches ASCII.
            let byte = if c.is_ascii() && !c.is_ascii_control() {
                c as u8
            } else {
                b'?'
            };
            self._send(byte, Register::Data);
        }
    }

    fn set_backlight(&mut self, level: u8) {
        let result = match level {
            0 => self.backlight.clear_pwm().map(|_| self.backlight.set_low()),
            MAX_BRIGHTNESS => self.backlight.clear_pwm().map(|_| self.backlight.set_high()),
            _ => self
                .backlight
                .set_pwm_frequency(BACKLIGHT_PWM_HZ, level as f64 / MAX_BRIGHTNESS as f64),
        };
        if let Err(e) = result {
            warn!("Failed to set backlight to {}: {}", level, e);
        }
    }
}
//////////////////////////// HD44780 Driver End ////////////////////////////


#[cfg(test)]
mod tests {
    use super::{testing::RecordingDisplay, *};

    #[test]
    fn rows_are_padded_and_truncated() {
        assert_eq!(fit_row("abc"), "abc             ");
        assert_eq!(fit_row("0123456789abcdefXYZ"), "0123456789abcdef");
    }

    #[test]
    fn show_overwrites_both_rows() {
        let recorder = RecordingDisplay::default();
        let shared = SharedDisplay::new(recorder.clone());

        shared.show(&["Timelapse".to_string(), "1. Interval".to_string()]);
        assert_eq!(recorder.row(0), "Timelapse");
        assert_eq!(recorder.row(1), "1. Interval");

        shared.show(&["Go".to_string(), String::new()]);
        assert_eq!(recorder.row(0), "Go");
        assert_eq!(recorder.row(1), "");
    }

    #[test]
    fn clear_blanks_both_rows() {
        let recorder = RecordingDisplay::default();
        let shared = SharedDisplay::new(recorder.clone());

        shared.show(&["Done 3 frames".to_string(), "4. Start".to_string()]);
        shared.clear();
        assert_eq!(recorder.log.lock().unwrap().clears, 1);
        assert_eq!(recorder.row(0), "");
        assert_eq!(recorder.row(1), "");
    }

    #[test]
    fn clones_share_one_display() {
        let recorder = RecordingDisplay::default();
        let shared = SharedDisplay::new(recorder.clone());
        let other = shared.clone();

        shared.set_backlight(10);
        other.set_backlight(20);
        other.show(&["a".to_string(), "row".to_string()]);
        assert_eq!(recorder.backlight_levels(), vec![10, 20]);
        assert_eq!(recorder.row(1), "row");
    }
}
