//! dapgate - a Debug Adapter Protocol (DAP) gateway.
//!
//! The gateway serves exactly one DAP client per session and translates the
//! protocol into commands against an external execution engine (see
//! [`engine::Engine`]). It owns the client connection lifecycle and the
//! mapping between transient engine state (call frames, compound values) and
//! protocol-visible integer handles.
//!
//! For DAP details see <https://microsoft.github.io/debug-adapter-protocol>.

pub mod build;
pub mod convert;
pub mod engine;
pub mod handles;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod value;

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "dap", "{:#}", e);
                None
            }
        }
    };
    ($res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!(target: "dap", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}
