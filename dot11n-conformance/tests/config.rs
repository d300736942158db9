use std::io::Write;

use dot11n_conformance::{ChannelModel, LinkSimulator};
use dot11n_core::config::{AMSDU_SIZE_1, QOS_MPDU_OVERHEAD};
use dot11n_core::{Dot11nConfig, Dot11nError, Tid};
use dot11n_mac::MacError;

fn write_config(body: &str) -> anyhow::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(body.as_bytes())?;
    Ok(file)
}

#[test]
fn file_configuration_drives_the_link() -> anyhow::Result<()> {
    let file = write_config(
        "enable_ampdu = true\n\
         mac_output_queue_size = 12\n\
         input_buffer_timeout_ms = 20\n\
         rng_seed = 99\n",
    )?;
    let config = Dot11nConfig::from_file(file.path())?;
    assert!(config.enable_ampdu);
    assert_eq!(config.mac_output_queue_size, 12);

    let mut sim = LinkSimulator::infrastructure(config.clone(), config, ChannelModel::default())?;
    for i in 0..30u8 {
        sim.push(0, Tid::from_priority(0), vec![i; 64]);
    }
    sim.run_until_idle(10_000)?;

    // the queue cap holds the rest upstream until room frees up
    assert!(sim.mac(0).stats().pkts_rejected_queue_full >= 1);
    assert_eq!(sim.delivered(1), 30);
    assert!(sim.mac(0).stats().ampdus_sent >= 3);
    Ok(())
}

#[test]
fn conflicting_file_configuration_is_rejected() -> anyhow::Result<()> {
    let file = write_config("enable_data_bursting = true\nenable_amsdu = true\n")?;
    assert!(matches!(Dot11nConfig::from_file(file.path()), Err(Dot11nError::InvalidConfig(_))));
    Ok(())
}

#[test]
fn invalid_configuration_never_builds_a_station() {
    let config = Dot11nConfig { enable_data_bursting: true, enable_ampdu: true, ..Dot11nConfig::default() };
    let err = LinkSimulator::infrastructure(config, Dot11nConfig::default(), ChannelModel::default()).unwrap_err();
    assert!(matches!(err, MacError::Config(Dot11nError::InvalidConfig(_))));
}

#[test]
fn smallest_accepted_fragmentation_threshold_still_sends_full_amsdus() -> anyhow::Result<()> {
    let too_small = Dot11nConfig { enable_amsdu: true, fragmentation_threshold: AMSDU_SIZE_1, ..Dot11nConfig::default() };
    assert!(matches!(too_small.validate(), Err(Dot11nError::InvalidConfig(_))));

    let config = Dot11nConfig { fragmentation_threshold: AMSDU_SIZE_1 + QOS_MPDU_OVERHEAD, ..too_small };
    let mut sim = LinkSimulator::infrastructure(config, Dot11nConfig::default(), ChannelModel::default())?;
    sim.push(0, Tid::from_priority(0), vec![1u8; 1900]);
    sim.push(0, Tid::from_priority(0), vec![2u8; 1900]);
    sim.run_until_idle(1_000)?;

    assert_eq!(sim.mac(0).stats().amsdus_created, 1);
    assert_eq!(sim.delivered(1), 2);
    Ok(())
}
