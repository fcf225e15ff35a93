/*! pikeyd — a GPIO keyboard daemon for the Raspberry Pi.
 *
 * Buttons wired to GPIO pins (directly, through MCP23008/MCP23017
 * I2C port expanders, or as switch matrices behind a strobe line)
 * become ordinary keyboard events on a uinput virtual keyboard.
 *
 * Everything is described by one configuration file, searched for as
 * `./pikeyd.conf`, `~/.pikeyd.conf`, then `/etc/pikeyd.conf`:
 *
 * ```text
 * KEY_A        GPIO4          # press the button on GPIO4, get an 'a'
 * MATRIX1      GPIO18         # a matrix strobed by GPIO18
 * KEY_LEFT     MATRIX1:22
 * XIO1         7/0x20/MCP23008
 * KEY_ENTER    XIO1:3
 * PULL_UP      GPIO4
 * REPEAT       GPIO4
 * ```
 *
 * The daemon polls every 4 ms, debounces (two stable samples), and
 * emits one key-down/key-up pair per binding on each debounced
 * press. Pins listed under `REPEAT` re-fire while held: first after
 * 80 ms, then 200 ms, then every 40 ms.
 *
 * Diagnostics go through `env_logger`; set `RUST_LOG=debug` to see
 * the parsed binding table and expander traffic.
 */

use anyhow::Context;

use pikeyd::pikeyd::{config, Engine, RppalExpanderBus, RppalPinBus, UinputKeySink};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut force_repeat = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-r" => force_repeat = true,
            "-v" => {
                show_version();
                return Ok(());
            }
            "-h" => {
                show_help();
                return Ok(());
            }
            other => {
                eprintln!("Unknown command line argument: {other}");
                show_help();
                std::process::exit(2);
            }
        }
    }

    let mut pins = RppalPinBus::new().context("GPIO bring-up failed")?;
    let mut xio_bus = RppalExpanderBus::new();

    let (model, summary) = config::load(&mut pins, &mut xio_bus)?;
    log::info!("Ready ({summary:?} mode).");

    let sink = UinputKeySink::new().context("cannot create uinput keyboard device")?;

    let mut engine = Engine::new(model, pins, xio_bus, sink);
    engine.set_force_repeat(force_repeat);
    engine.run();
    Ok(())
}

fn show_help() {
    println!("Usage: pikeyd [option]");
    println!("Options:");
    println!("  -r    force key repeat on every pin");
    println!("  -v    version");
    println!("  -h    this help");
    println!();
    println!("Set RUST_LOG=debug for configuration and expander diagnostics.");
}

fn show_version() {
    println!("pikeyd {}", env!("CARGO_PKG_VERSION"));
    println!("GPIO keyboard daemon for the Raspberry Pi.");
}
