use std::io;

use dotenvy::dotenv;
use tracing::warn;

/// Loads the local `.env`, if any, into the environment so that every
/// `SIMCHAIN_*` option can be set from it.
///
/// An unreadable file is treated as a missing one.
pub fn load_dotenvy_vars_if_present() {
    match dotenv() {
        Ok(_) | Err(dotenvy::Error::Io(io::Error { .. })) => (),
        Err(e) => warn!("Found local `.env` file but was unable to parse it! (err: {e})"),
    }
}
