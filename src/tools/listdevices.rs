// List attached Apple mobile devices by udid.

use clap::{Arg, Command};

fn main() {
    env_logger::init();

    let matches = Command::new("imobile_id")
        .about("List attached Apple mobile devices")
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Also print bus numbers and addresses")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let devices = match imobile::usb::list_devices() {
        Ok(devices) => devices,
        Err(e) => {
            eprintln!("imobile_id: {e}");
            std::process::exit(1);
        }
    };

    for device in devices {
        if matches.get_flag("verbose") {
            println!(
                "{} (bus {}, address {})",
                device.udid, device.bus_number, device.address
            );
        } else {
            println!("{}", device.udid);
        }
    }
}
