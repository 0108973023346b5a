use std::{env, process::exit, time::Duration};

use log::warn;
use strum_macros::EnumString;

use keithley_s46::{
    equipment::{
        drivers::switch_keithley_s46::{KeithleyS46, S46Config},
        rf_switch::RfSwitchEquipment,
    },
    error::Result,
    resource::{AccessMode, DefaultRM},
};

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, EnumString)]
#[strum(serialize_all = "kebab-case")]
enum Command {
    Idn,
    Reset,
    Open,
    OpenAll,
    Close,
    List,
}

enum Action {
    Idn,
    Reset,
    Open(u32),
    OpenAll,
    Close(u32),
    List,
}

fn usage() -> ! {
    println!("keithley-s46 {}", keithley_s46::version());
    println!("Usage: ... <resource> <command> [channel]");
    println!("  <resource>:");
    println!("    GPIB<board>::<address>           via the adapter in S46_GPIB<board>");
    println!("    TCPIP::<host>::INSTR             VXI-11");
    println!("    TCPIP::<host>::<port>::SOCKET    raw SCPI socket");
    println!("  <command>:");
    println!("    idn            identify the instrument");
    println!("    reset          reset the instrument, opening all channels");
    println!("    open <ch>      open channel 1-32");
    println!("    open-all       open every channel");
    println!("    close <ch>     close channel 1-32, opening the rest of its relay");
    println!("    list           list closed channels");
    println!("  Environment:");
    println!("    S46_GPIB<n>=serial:<path>[?baud=<baud>] | tcp://<host>[:<port>]");
    println!("    S46_IO_TIMEOUT_MS=<ms>");
    println!("    S46_GROUP_SAFETY=best-effort | strict");
    exit(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 || args.len() > 4 {
        usage();
    }

    let resource = &args[1];
    let Ok(command) = args[2].parse::<Command>() else {
        println!("Command '{}' not supported", args[2]);
        usage();
    };
    let action = match (command, args.get(3)) {
        (Command::Open, Some(ch)) => Action::Open(ch.parse()?),
        (Command::Close, Some(ch)) => Action::Close(ch.parse()?),
        (Command::Open | Command::Close, None) => {
            println!("Command '{}' needs a channel", args[2]);
            usage();
        }
        (_, Some(_)) => {
            println!("Command '{}' takes no channel", args[2]);
            usage();
        }
        (Command::Idn, None) => Action::Idn,
        (Command::Reset, None) => Action::Reset,
        (Command::OpenAll, None) => Action::OpenAll,
        (Command::List, None) => Action::List,
    };

    let rm = DefaultRM::from_env()?;
    let mut s46 = KeithleyS46::with_config(S46Config::from_env()?);
    s46.open_resource(&rm, resource, AccessMode::NoLock, OPEN_TIMEOUT)
        .await?;

    let res = run(&s46, action).await;
    let closed = s46.close().await;

    Ok(command_outcome(res, closed)?)
}

/// The command's own failure wins over a failure to close afterwards
fn command_outcome(res: Result<()>, closed: Result<()>) -> Result<()> {
    match (res, closed) {
        (Err(e), Err(close_err)) => {
            warn!("Closing the session also failed: {close_err}");
            Err(e)
        }
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Ok(()), Ok(())) => Ok(()),
    }
}

async fn run(s46: &KeithleyS46, action: Action) -> Result<()> {
    match action {
        Action::Idn => println!("{}", s46.identify().await?),
        Action::Reset => s46.reset().await?,
        Action::Open(ch) => s46.open_channel(ch).await?,
        Action::OpenAll => s46.open_all_channels().await?,
        Action::Close(ch) => s46.close_channel(ch).await?,
        Action::List => {
            let closed = s46.closed_channels().await?;
            println!("{closed}");
            for relay in closed.conflicting_relays() {
                println!("warning: more than one path of relay {relay} closed");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use keithley_s46::error::Error;

    use super::*;

    #[test]
    fn command_failure_not_masked_by_close() {
        let res = command_outcome(
            Err(Error::Timeout("CLOSE?".into())),
            Err(Error::NotConnected),
        );
        assert!(matches!(res, Err(Error::Timeout(_))));

        let res = command_outcome(Ok(()), Err(Error::NotConnected));
        assert!(matches!(res, Err(Error::NotConnected)));

        assert!(command_outcome(Ok(()), Ok(())).is_ok());
    }
}
