//! Fieldcom command line interface.

use std::{process, time::Duration};

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
    ArgMatches,
};
use console::style;
use crossterm::terminal::disable_raw_mode;
use log::{debug, error, trace, LevelFilter};
use simplelog::*;

use fieldcom::{self as fc, FieldTransports, Session, TerminalConsole};

fn main() {
    println!("[FC] fieldcom v{}", crate_version!());

    ctrlc::set_handler(move || {
        let _ = disable_raw_mode();
        println!("🛑 received Ctrl+C!");
        process::exit(0);
    })
    .expect("Failed to install my Ctrl-C handler!");

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Fieldcom keeps an interactive session with a field device. It \
            talks to the device over TCP when the device is on the network \
            and falls back to Bluetooth Low Energy when it is not. Every line \
            typed is sent to the device and its reply printed, except for a \
            few local commands:\n\
               \t* `setwifi <ssid> <pwd>` configures the device Wi-Fi and \
            switches to TCP once the device reports it is up \n\
               \t* `ota [path]` pushes a firmware image over the active \
            transport and waits for the device to reboot \n\
               \t* `dht` reads the sensor endpoint (BLE) \n\
               \t* `/q`, `quit` or `exit` ends the session \n\
            \n\
            Fieldcom can be started before or after the device is powered \
            and survives the device rebooting or leaving the network.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("HOST")
                .help("device host name or IP address")
                .short("-H")
                .long("--host")
                .takes_value(true)
                .default_value("192.168.10.125")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PORT")
                .help("device TCP port")
                .short("-p")
                .long("--port")
                .takes_value(true)
                .default_value("8080")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("TOKEN")
                .help("shared secret sent as `AUTH <token>`")
                .short("-t")
                .long("--token")
                .takes_value(true)
                .default_value("baker")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BLE_ADDR")
                .help("fixed BLE address of the device")
                .long_help(
                    "fixed BLE address of the device; when set, only this \
                     address is accepted during discovery, whatever the \
                     advertised name.",
                )
                .long("--ble-addr")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BLE_NAME")
                .help("advertised BLE name accepted as the device (repeatable)")
                .long("--ble-name")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("REBOOT_WAIT")
                .help("seconds the device needs to reboot after an upload")
                .long("--reboot-wait")
                .takes_value(true)
                .default_value("10")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("RECONNECT_TRIES")
                .help("TCP attempts before falling back to BLE")
                .long("--reconnect-tries")
                .takes_value(true)
                .default_value("12")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("RECONNECT_DELAY")
                .help("milliseconds between TCP attempts")
                .long("--reconnect-delay")
                .takes_value(true)
                .default_value("1000")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BLE_MTU")
                .help("ATT MTU assumed when sizing BLE upload frames")
                .long("--ble-mtu")
                .takes_value(true)
                .default_value("23")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("STRICT_FINISH")
                .help("report a BLE upload as failed when FINISH is refused")
                .long("--strict-finish"),
        )
        .arg(
            Arg::with_name("MAX_RECOVERIES")
                .help("give up after this many failed connect cycles")
                .long("--max-recoveries")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FIRMWARE")
                .help("firmware image pushed by `ota` without a path")
                .long_help(
                    "firmware image pushed by `ota` without a path; when not \
                     set, `fieldcom` offers the `.bin` files of the current \
                     working directory.",
                )
                .index(1),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'fieldcom -v -v -v' or 'fieldcom -vvv' vs 'fieldcom -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    TermLogger::init(log_level, Config::default(), TerminalMode::Mixed).unwrap();

    trace!("{:#?}", matches);

    // Arguments with default values ===========================================

    // It's safe to call unwrap on all command line arguments with default
    // values, because the value with either be what the user input at runtime
    // or the default value

    let port = numeric::<u16>(&matches, "PORT", "port");
    let reboot_wait = numeric::<u64>(&matches, "REBOOT_WAIT", "reboot-wait");
    let reconnect_tries = numeric::<u32>(&matches, "RECONNECT_TRIES", "reconnect-tries");
    let reconnect_delay = numeric::<u64>(&matches, "RECONNECT_DELAY", "reconnect-delay");
    let ble_mtu = numeric::<usize>(&matches, "BLE_MTU", "ble-mtu");

    // END - Arguments with default values =====================================

    let mut builder = fc::SettingsBuilder::default()
        .host(matches.value_of("HOST").unwrap())
        .port(port)
        .token(matches.value_of("TOKEN").unwrap())
        .reboot_wait(Duration::from_secs(reboot_wait))
        .reconnect(reconnect_tries, Duration::from_millis(reconnect_delay))
        .ble_mtu(ble_mtu)
        .optimistic_finish(!matches.is_present("STRICT_FINISH"));

    // START - Arguments with NO default values ================================

    if let Some(address) = matches.value_of("BLE_ADDR") {
        builder = builder.ble_address(address);
    }

    if let Some(names) = matches.values_of("BLE_NAME") {
        builder = builder.ble_names(names);
    }

    if matches.is_present("MAX_RECOVERIES") {
        builder = builder.max_recovery_cycles(numeric::<u32>(
            &matches,
            "MAX_RECOVERIES",
            "max-recoveries",
        ));
    }

    if let Some(image) = matches.value_of("FIRMWARE") {
        builder = builder.firmware_image(image);
    }

    // END - Arguments =========================================================

    let settings = builder.finalize();
    debug!("{:#?}", settings);

    // Run the session =========================================================

    let transports = FieldTransports::new(&settings).unwrap_or_else(|e| {
        error!("{}", e);
        println!("{}: {}", style("error").red(), e);
        process::exit(-1);
    });
    let mut session = Session::new(settings, transports);
    let exit_code = session.run(&mut TerminalConsole::new());
    debug!("exit code: {}", exit_code);
    std::process::exit(exit_code.into());
}

/// Parse a numeric argument or exit with a usage error.
fn numeric<N: std::str::FromStr>(matches: &ArgMatches, name: &str, flag: &str) -> N {
    value_t!(matches.value_of(name), N).unwrap_or_else(|_| {
        println!(
            "{}: `{}` needs to be a numeric value",
            style("error").red(),
            style(flag).cyan()
        );
        println!(
            "   {} `{}` is not a valid value",
            style("-->").cyan(),
            style(matches.value_of(name).unwrap_or_default()).on_red()
        );
        process::exit(-1);
    })
}
