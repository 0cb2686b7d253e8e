//! Command line client for the wardrobe backend.
//!
//! Resolves signed photo URLs, shows the current session, and deletes items through the same
//! sync layer the app uses, which makes it handy for poking at a backend by hand.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
