pub mod drivers;
pub mod rf_switch;

use drivers::switch_keithley_s46::{KeithleyS46, S46Config};
use rf_switch::RfSwitchEquipment;

use crate::{
    error::{Error, Result},
    model::{KeithleyFamily, Manufacturer},
    protocol::ScpiProtocol,
};

pub enum Equipment {
    RfSwitch(Box<dyn RfSwitchEquipment>),
}

/// Identify the instrument behind a connected session and wrap it in the
/// matching driver
pub async fn equipment_from_scpi(mut proto: Box<dyn ScpiProtocol>) -> Result<Equipment> {
    let model = proto.model().await?;

    match model.man_family {
        Manufacturer::Keithley(KeithleyFamily::S46) => Ok(Equipment::RfSwitch(Box::new(
            KeithleyS46::from_session(proto, S46Config::default()),
        ))),
        _ => Err(Error::NotSupported(format!("No driver for {model}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mock::MockScpi;

    #[tokio::test]
    async fn detects_s46() {
        let (mock, transcript) = MockScpi::new();
        let mock = mock.respond("KEITHLEY INSTRUMENTS INC.,MODEL S46,4007621,A05\n");

        let Equipment::RfSwitch(switch) = equipment_from_scpi(Box::new(mock)).await.unwrap();
        switch.open_all_channels().await.unwrap();
        assert_eq!(transcript.writes(), vec!["*IDN?", "OPEN:ALL"]);
    }

    #[tokio::test]
    async fn rejects_other_instruments() {
        let (mock, _) = MockScpi::new();
        let mock = mock.respond("KEITHLEY INSTRUMENTS INC.,MODEL 2000,1234,A01\n");
        assert!(matches!(
            equipment_from_scpi(Box::new(mock)).await,
            Err(Error::NotSupported(_))
        ));

        let (mock, _) = MockScpi::new();
        let mock = mock.respond("Rigol Technologies,DP832,DP8A1234,00.01.14\n");
        assert!(matches!(
            equipment_from_scpi(Box::new(mock)).await,
            Err(Error::NotSupported(_))
        ));
    }
}
