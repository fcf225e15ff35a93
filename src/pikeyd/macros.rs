/** Prints to stderr, does not append a new line, and immediately
 * flushes output. Used to watch the poll engine's raw and pending
 * masks change cycle by cycle.
 *
 * This is the debug version, there is a no-op non-debug version,
 * too. To build with the non-debug version do not build with
 * `--features debug_poll_print`.
 */
#[cfg(feature = "debug_poll_print")]
#[macro_export]
macro_rules! debug_poll {
    ($( $args:expr ),*) => { eprint!( $( $args ),* ); let _ = std::io::Write::flush(&mut std::io::stderr()); }
}

/** No-op, non-debug version of the macro.
 *
 *  The other, debug, version prints to stderr and immediately
 *  flushes, showing the poll engine's sampled masks each cycle.
 *
 *   To run the debug version:
 *
 * ```text
 *   cargo run --features debug_poll_print
 * ```
 */
#[macro_export]
#[cfg(not(feature = "debug_poll_print"))]
macro_rules! debug_poll {
    ($( $args:expr ),*) => {};
}
