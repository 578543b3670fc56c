// Query lockdown values from a device.

use clap::{Arg, Command};
use imobile::{Device, LockdownClient, PairRecord};

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("imobile_info")
        .about("Read values from the device's lockdown service")
        .arg(Arg::new("udid").value_name("UDID").index(1))
        .arg(
            Arg::new("key")
                .short('k')
                .long("key")
                .value_name("KEY")
                .help("Value to query; the whole dictionary without it"),
        )
        .arg(
            Arg::new("domain")
                .short('q')
                .long("domain")
                .value_name("DOMAIN")
                .help("Domain to query, e.g. com.apple.mobile.battery"),
        )
        .arg(
            Arg::new("pair_record")
                .short('p')
                .long("pair-record")
                .value_name("PATH")
                .help("Pair record plist; starts a session before querying"),
        )
        .get_matches();

    if let Err(e) = run(&matches).await {
        eprintln!("imobile_info: {e}");
        std::process::exit(1);
    }
}

async fn run(matches: &clap::ArgMatches) -> Result<(), imobile::Error> {
    let udid = matches.get_one::<String>("udid").map(String::as_str);
    let device = Device::open(udid).await?;
    let mut lockdown = LockdownClient::connect(&device, "imobile_info").await?;

    if let Some(path) = matches.get_one::<String>("pair_record") {
        let record = PairRecord::read_from_file(path)?;
        lockdown.start_session(&record).await?;
    }

    let value = lockdown
        .get_value(
            matches.get_one::<String>("key").map(String::as_str),
            matches.get_one::<String>("domain").map(String::as_str),
        )
        .await?;

    match value {
        plist::Value::String(s) => println!("{s}"),
        value => {
            let xml = imobile::encode_plist(&value, imobile::PlistFormat::Xml)?;
            println!("{}", String::from_utf8_lossy(&xml));
        }
    }

    lockdown.close().await;
    device.close().await;
    Ok(())
}
