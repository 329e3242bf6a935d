// -----------------------------------------------------------------------------
// Rust kiln control daemon
//
// This program is free software; you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation; either version 2 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program; if not, write to the Free Software Foundation, Inc.,
// 59 Temple Place, Suite 330, Boston, MA  02111-1307  USA
//
// Module authors:
//   Georg Brandl <g.brandl@fz-juelich.de>
//
// -----------------------------------------------------------------------------
//
//! The main entry point for the kiln daemon.

use log::*;
use clap::Parser;
use mlzutil::fs as fsutil;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use kiln_core::config::load_config;
use kiln_core::oven::Oven;
use kiln_modules::create_backends;


#[derive(Parser)]
#[clap(name = "kiln", version,
       author = "Georg Brandl, Enrico Faulhaber",
       about = "A control daemon for resistive electric kilns.")]
struct Args {
    /// Debug logging output?
    #[clap(short, long)]
    verbose: bool,
    /// Logging path
    #[clap(long, default_value = "log")]
    log: String,
    /// PID path
    #[clap(long, default_value = "pid")]
    pid: String,
    /// Daemonize?
    #[clap(short, long)]
    daemon: bool,
    /// User name for daemon
    #[clap(long)]
    user: Option<String>,
    /// Group name for daemon
    #[clap(long)]
    group: Option<String>,
    /// Configuration file name to load
    config: String,
}

fn main() {
    let args = Args::parse();

    let log_path = fsutil::abspath(&args.log);
    let pid_path = fsutil::abspath(&args.pid);
    if args.daemon {
        let mut daemon = daemonize::Daemonize::new();
        if let Some(user) = &args.user {
            daemon = daemon.user(&**user);
        }
        if let Some(group) = &args.group {
            daemon = daemon.group(&**group);
        }
        if let Err(err) = daemon.start() {
            eprintln!("could not daemonize process: {}", err);
        }
    }

    // handle SIGINT and SIGTERM
    let mut signals = Signals::new(&[SIGINT, SIGTERM]).expect("signal register failed");

    if let Err(err) = mlzlog::init(Some(log_path), "kiln", mlzlog::Settings {
        show_appname: false,
        debug: args.verbose,
        use_stdout: !args.daemon,
        ..Default::default()
    }) {
        eprintln!("could not initialize logging: {}", err);
    }
    if let Err(err) = fsutil::write_pidfile(&pid_path, "kiln") {
        error!("could not write PID file: {}", err);
    }

    // set a panic hook to log panics into the logfile
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s
        } else {
            "???"
        };
        if let Some(location) = panic_info.location() {
            error!("panic: {:?} ({})", payload, location);
        } else {
            error!("panic: {:?}", payload)
        }
        // call the original hook to get backtrace if requested
        default_hook(panic_info);
    }));

    // load the config, set up the hardware and run!
    match load_config(&args.config) {
        Err(err) => error!("could not read config file {}: {}", args.config, err),
        Ok(cfg) => match create_backends(&cfg.hardware) {
            Err(err) => error!("could not set up hardware backends: {}", err),
            Ok(backends) => {
                info!("starting control loop ({} hardware)...", cfg.hardware.class);
                match Oven::start(cfg, backends.sensor, backends.heater, backends.sim) {
                    Err(err) => error!("could not start control loop: {}", err),
                    Ok(_handle) => {
                        // the oven is running; wait for a signal to finish
                        let _ = signals.forever().next();
                    }
                }
            }
        }
    }

    info!("quitting...");
    fsutil::remove_pidfile(pid_path, "kiln");
}
