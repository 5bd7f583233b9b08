//! Session affinity support: session key dispatchers and the binding table.

mod dispatcher;
mod table;

pub use dispatcher::{
    ClientIdDispatcher, DispatcherKind, HttpCookieDispatcher, SessionDispatcher,
    SoapSessionDispatcher,
};
pub use table::{DispatchTable, SessionBinding};
