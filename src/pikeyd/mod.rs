/*! Core of the GPIO keyboard daemon.
 *
 * The daemon turns button presses on Raspberry Pi GPIO pins into
 * ordinary keyboard events. Buttons can hang off the Pi's own pins,
 * off MCP23008/MCP23017 I2C port expanders, or off switch matrices
 * that share a strobe line.
 *
 * Everything is driven by one plain-text configuration file
 * (`pikeyd.conf`) and one fixed-cadence poll loop:
 *
 * - [`config`] parses the file into the in-memory binding model,
 *   configuring pins as it goes.
 *
 * - [`model`] holds the result: per-pin chains of bound keys, one
 *   chain set per matrix group or expander device.
 *
 * - [`engine`] samples each group every 4 ms, debounces, fires key
 *   dispatches for stabilized presses, and runs the key-repeat timing
 *   cycle.
 *
 * - [`xio`] decodes expander input-register bytes into per-pin taps.
 *
 * Actual hardware access sits behind the three small traits in
 * [`hw`], so the whole core runs unchanged against in-memory fakes in
 * tests.
 */

pub mod config;
pub mod engine;
pub mod hw;
pub mod hw_specific;
pub mod keymap;
mod macros;
pub mod model;
pub mod xio;

use std::fmt;

use thiserror::Error;

pub use engine::Engine;
pub use hw::{ExpanderBus, KeySink, PinBus, RppalExpanderBus, RppalPinBus, UinputKeySink};
pub use model::{
    BindingModel, ExpanderDevice, ExpanderKind, KeyBinding, KeyChains, MatrixGroup, NO_KEY,
};

/// Direction a GPIO pin has been configured for. A pin keeps its first
/// configuration for the life of the process; asking for the opposite
/// direction later is a configuration conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDirection {
    Input,
    Output,
}

impl fmt::Display for PinDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinDirection::Input => write!(f, "input"),
            PinDirection::Output => write!(f, "output"),
        }
    }
}

/// Internal pull-resistor mode for an input pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    Float,
    Down,
    Up,
}

/// Outcome of a successful `configure_pin` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinSetup {
    /// The pin was newly claimed and configured.
    Configured,
    /// The pin was already configured for the same direction; nothing
    /// was changed.
    AlreadyConfigured,
}

/// What kind of hardware the configuration ended up describing. When
/// several apply the highest classification wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSummary {
    /// Direct GPIO buttons only.
    Direct,
    /// At least one I2C expander is present.
    Expander,
    /// At least one switch matrix group is present.
    Matrix,
}

/// Fatal configuration problems. Every parse-time error carries the
/// file name and line number it was detected on; none of these are
/// recoverable and the daemon exits without starting the poll loop.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no configuration file found (./pikeyd.conf, ~/.pikeyd.conf, /etc/pikeyd.conf)")]
    NotFound,

    #[error("{file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ERROR: {file} line {line}: {msg}")]
    Parse {
        file: String,
        line: usize,
        msg: String,
    },

    /// Expander register bring-up failed after a clean parse.
    #[error(transparent)]
    Hw(#[from] HwError),
}

/// Hardware-level failures from the collaborator backends.
#[derive(Error, Debug)]
pub enum HwError {
    #[error("GPIO{pin:02} already configured for {configured}.")]
    PinDirectionConflict { pin: u8, configured: PinDirection },

    #[error("GPIO{pin:02} pull resistor not set, pin not set for input.")]
    PinNotInput { pin: u8 },

    #[error("gpio: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("i2c: {0}")]
    I2c(#[from] rppal::i2c::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}
