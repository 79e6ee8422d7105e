use log::debug;

use pegvm::vm::{Host, ThunkCall};

/// Logs code blocks instead of running them. Every predicate holds.
pub struct LoggingHost;

impl Host for LoggingHost {
    type Value = ();

    fn init(&mut self, code: &str) {
        debug!("init {{ {} }}", code);
    }

    fn action(&mut self, call: &ThunkCall<'_>) {
        debug!(
            "action {} at {} {:?}: {{ {} }}",
            call.index, call.position, call.args, call.code
        );
    }

    fn predicate(&mut self, call: &ThunkCall<'_>) -> bool {
        debug!(
            "predicate {} at {} {:?}: {{ {} }}",
            call.index, call.position, call.args, call.code
        );
        true
    }
}
