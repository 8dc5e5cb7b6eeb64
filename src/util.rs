// Debug-only trace output. `trace!` prints one line per dispatched
// instruction, gated on the `debug_trace_execution` feature (or test
// builds, so the VM's own tests exercise the same code path); `trace_stack!`
// dumps the value stack before each instruction, gated on its own feature
// since it is far noisier.
#[macro_export]
macro_rules! trace(
    ( $($thing:expr),* ) => {
        if cfg!(any(feature = "debug_trace_execution", test)) { println! { $($thing),* } }
    };
);

#[macro_export]
macro_rules! trace_stack(
    ( $($thing:expr),* ) => {
        if cfg!(feature = "debug_trace_stack") { println! { $($thing),* } }
    };
);
