/*! Hardware collaborators.
 *
 * The core only ever talks to hardware through the three traits
 * below: pin configuration and level sampling, expander register
 * transport, and key-event delivery. The real backends are rppal
 * (GPIO, I2C) and an evdev uinput virtual keyboard; tests substitute
 * in-memory fakes.
 */

use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{AttributeSet, EventType, InputEvent, Key};
use rppal::gpio::{Gpio, InputPin, Level, OutputPin};
use rppal::i2c::I2c;

use crate::pikeyd::hw_specific::{MAX_KEY_CODE, NUM_GPIO, UINPUT_DEVICE_NAME};
use crate::pikeyd::{HwError, PinDirection, PinSetup, PullMode};

/// Pin-level GPIO access for the poll engine and the parser's pin
/// setup side effects.
pub trait PinBus {
    /// Claim a pin for `dir`. Re-claiming with the same direction is
    /// a no-op ([`PinSetup::AlreadyConfigured`]); the opposite
    /// direction is a conflict error.
    fn configure_pin(&mut self, pin: u8, dir: PinDirection) -> Result<PinSetup, HwError>;

    /// Set the pull resistor of a pin already configured as input.
    fn set_pull(&mut self, pin: u8, pull: PullMode) -> Result<(), HwError>;

    /// Current level of every input pin as a bitmask (bit set = line
    /// high). Callers mask with their own pin set.
    fn read_levels(&mut self) -> u32;

    /// Drive an output (strobe) pin.
    fn drive(&mut self, pin: u8, high: bool);
}

/// Register transport to I2C expander chips.
pub trait ExpanderBus {
    /// Write `data` starting at register `reg` of the device at
    /// `addr`.
    fn write_registers(&mut self, addr: u16, reg: u8, data: &[u8]) -> Result<(), HwError>;

    /// Read one register of the device at `addr`.
    fn read_register(&mut self, addr: u16, reg: u8) -> Result<u8, HwError>;
}

/// Delivery of synthesized key events to the host.
pub trait KeySink {
    fn send_key(&mut self, code: u16, pressed: bool) -> Result<(), HwError>;
}

enum SetupPin {
    Input(InputPin),
    Output(OutputPin),
}

/// rppal-backed [`PinBus`]. Keeps the claimed pin handles and a
/// direction flag per pin so configuration conflicts are caught here
/// rather than deep inside the kernel driver.
pub struct RppalPinBus {
    gpio: Gpio,
    flags: [Option<PinDirection>; NUM_GPIO],
    pins: Vec<Option<SetupPin>>,
}

impl RppalPinBus {
    pub fn new() -> Result<Self, HwError> {
        let gpio = Gpio::new()?;
        Ok(RppalPinBus {
            gpio,
            flags: [None; NUM_GPIO],
            pins: (0..NUM_GPIO).map(|_| None).collect(),
        })
    }
}

impl PinBus for RppalPinBus {
    fn configure_pin(&mut self, pin: u8, dir: PinDirection) -> Result<PinSetup, HwError> {
        match self.flags[pin as usize] {
            None => {
                let p = self.gpio.get(pin)?;
                self.pins[pin as usize] = Some(match dir {
                    PinDirection::Input => SetupPin::Input(p.into_input()),
                    // Matrix strobes rest high; only the polled group's
                    // strobe goes low, briefly.
                    PinDirection::Output => SetupPin::Output(p.into_output_high()),
                });
                self.flags[pin as usize] = Some(dir);
                Ok(PinSetup::Configured)
            }
            Some(d) if d == dir => Ok(PinSetup::AlreadyConfigured),
            Some(d) => Err(HwError::PinDirectionConflict {
                pin,
                configured: d,
            }),
        }
    }

    fn set_pull(&mut self, pin: u8, pull: PullMode) -> Result<(), HwError> {
        if self.flags[pin as usize] != Some(PinDirection::Input) {
            return Err(HwError::PinNotInput { pin });
        }
        // rppal fixes the pull mode when the pin is converted to an
        // input, so rebuild the pin handle with the requested mode.
        let Some(SetupPin::Input(mut old)) = self.pins[pin as usize].take() else {
            return Err(HwError::PinNotInput { pin });
        };
        old.set_reset_on_drop(false);
        drop(old);
        let p = self.gpio.get(pin)?;
        let rebuilt = match pull {
            PullMode::Up => p.into_input_pullup(),
            PullMode::Down => p.into_input_pulldown(),
            PullMode::Float => p.into_input(),
        };
        self.pins[pin as usize] = Some(SetupPin::Input(rebuilt));
        Ok(())
    }

    fn read_levels(&mut self) -> u32 {
        let mut bits = 0u32;
        for (n, slot) in self.pins.iter().enumerate() {
            if let Some(SetupPin::Input(p)) = slot {
                if p.is_high() {
                    bits |= 1 << n;
                }
            }
        }
        bits
    }

    fn drive(&mut self, pin: u8, high: bool) {
        if let Some(SetupPin::Output(p)) = &mut self.pins[pin as usize] {
            p.write(if high { Level::High } else { Level::Low });
        }
    }
}

/// rppal-backed [`ExpanderBus`]. The I2C bus is opened lazily on
/// first use so configurations without expanders never touch the
/// i2c-dev interface.
pub struct RppalExpanderBus {
    i2c: Option<I2c>,
}

impl Default for RppalExpanderBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RppalExpanderBus {
    pub fn new() -> Self {
        RppalExpanderBus { i2c: None }
    }

    fn bus(&mut self) -> Result<&mut I2c, HwError> {
        if self.i2c.is_none() {
            self.i2c = Some(I2c::new()?);
        }
        Ok(self.i2c.as_mut().expect("i2c bus just opened"))
    }
}

impl ExpanderBus for RppalExpanderBus {
    fn write_registers(&mut self, addr: u16, reg: u8, data: &[u8]) -> Result<(), HwError> {
        let bus = self.bus()?;
        bus.set_slave_address(addr)?;
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.push(reg);
        buf.extend_from_slice(data);
        bus.write(&buf)?;
        Ok(())
    }

    fn read_register(&mut self, addr: u16, reg: u8) -> Result<u8, HwError> {
        let bus = self.bus()?;
        bus.set_slave_address(addr)?;
        let mut out = [0u8; 1];
        bus.write_read(&[reg], &mut out)?;
        Ok(out[0])
    }
}

/// uinput-backed [`KeySink`]: one virtual keyboard named "pikeyd"
/// with every plain key code registered.
pub struct UinputKeySink {
    device: VirtualDevice,
}

impl UinputKeySink {
    pub fn new() -> Result<Self, HwError> {
        let mut keys = AttributeSet::<Key>::new();
        for code in 0..MAX_KEY_CODE {
            keys.insert(Key::new(code));
        }
        let device = VirtualDeviceBuilder::new()?
            .name(UINPUT_DEVICE_NAME)
            .with_keys(&keys)?
            .build()?;
        Ok(UinputKeySink { device })
    }
}

impl KeySink for UinputKeySink {
    fn send_key(&mut self, code: u16, pressed: bool) -> Result<(), HwError> {
        let event = InputEvent::new(EventType::KEY, code, i32::from(pressed));
        self.device.emit(&[event])?;
        Ok(())
    }
}
