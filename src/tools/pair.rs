// Pair with a device and store the resulting record.

use clap::{Arg, Command};
use imobile::{
    pair_record::{FilePairRecordStore, PairRecordStore},
    Device, LockdownClient,
};

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = Command::new("imobile_pair")
        .about("Pair with a device; accept the trust dialog when it appears")
        .arg(Arg::new("udid").value_name("UDID").index(1))
        .arg(
            Arg::new("records")
                .short('r')
                .long("records")
                .value_name("DIR")
                .default_value("./pair-records")
                .help("Directory the pair record is stored in"),
        )
        .get_matches();

    if let Err(e) = run(&matches).await {
        eprintln!("imobile_pair: {e}");
        std::process::exit(1);
    }
}

async fn run(matches: &clap::ArgMatches) -> Result<(), imobile::Error> {
    let udid = matches.get_one::<String>("udid").map(String::as_str);
    let store = FilePairRecordStore::new(matches.get_one::<String>("records").unwrap());

    let device = Device::open(udid).await?;
    let udid = device.udid().to_string();

    if store.load(&udid).is_some() {
        println!("{udid} is already paired");
        device.close().await;
        return Ok(());
    }

    let mut lockdown = LockdownClient::connect(&device, "imobile_pair").await?;
    let system_buid = uuid::Uuid::new_v4().to_string().to_uppercase();
    let record = lockdown.pair(None, system_buid).await?;
    store.save(&udid, &record)?;

    println!("paired {udid} with HostID {}", record.host_id);

    lockdown.close().await;
    device.close().await;
    Ok(())
}
