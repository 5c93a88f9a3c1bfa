//! Identification and bus-negotiation behavior against virtual cards:
//! the tier ladder, host-mask degradation, tuning failure fallback and
//! the negotiated end state.

mod common;

use common::{attach_mock, default_caps, MockState, VirtualCard};
use sdmmc_protocol::sdmmc::mmc_struct::{MmcBusWidth, MmcTiming};
use sdmmc_protocol::sdmmc::sdmmc_capability::*;
use sdmmc_protocol::sdmmc::sdmmc_constant::*;
use sdmmc_protocol::sdmmc::{MmcSignalVoltage, SdmmcConfig};

#[test]
fn emmc_reaches_hs200_with_tuning() {
    let caps = default_caps() | MMC_TIMING_MMC_HS200;
    let (controller, state) = attach_mock(
        caps,
        SdmmcConfig {
            emmc: true,
            ..SdmmcConfig::default()
        },
        MockState {
            card: Some(VirtualCard::emmc().without_device_type(EXT_CSD_CARD_TYPE_HS400_1_8V)),
            present: true,
            tuning_passes: true,
            ..MockState::default()
        },
    );

    controller.setup_card().unwrap();
    controller.tune_performance().unwrap();

    let card_state = controller.card_state().unwrap();
    assert_eq!(card_state.timing, MmcTiming::MmcHs200);
    assert_eq!(card_state.bus_width, MmcBusWidth::Width8);

    let st = state.lock().unwrap();
    assert_eq!(st.tuning_calls, 1);
    assert_eq!(st.last_voltage, Some(MmcSignalVoltage::Voltage180));

    // Card-side feature flags landed in the capability mask.
    let caps = controller.capabilities();
    assert_ne!(caps & MMC_CAP_TRIM, 0);
    assert_ne!(caps & MMC_CAP_SECURE_ERASE, 0);
    assert_ne!(caps & MMC_CAP_CACHE, 0);
    assert_ne!(caps & MMC_CAP_HIGH_CAPACITY, 0);
}

#[test]
fn host_mask_degrades_to_next_tier_without_failing() {
    // The card advertises HS200/HS400; the host mask has the tuned tiers
    // cleared but keeps high speed and DDR. Negotiation must settle there
    // and identification must succeed.
    let caps = default_caps() | MMC_TIMING_MMC_DDR52;
    let (controller, state) = attach_mock(
        caps,
        SdmmcConfig {
            emmc: true,
            ..SdmmcConfig::default()
        },
        MockState {
            card: Some(VirtualCard::emmc()),
            present: true,
            tuning_passes: true,
            ..MockState::default()
        },
    );

    controller.setup_card().unwrap();
    controller.tune_performance().unwrap();

    let card_state = controller.card_state().unwrap();
    assert_eq!(card_state.timing, MmcTiming::MmcDdr52);
    assert_eq!(card_state.bus_width, MmcBusWidth::Width8);

    // The tuned tiers were never attempted.
    assert_eq!(state.lock().unwrap().tuning_calls, 0);
}

#[test]
fn tuning_failure_falls_back_a_tier() {
    let caps = default_caps() | MMC_TIMING_MMC_HS200;
    let (controller, state) = attach_mock(
        caps,
        SdmmcConfig {
            emmc: true,
            ..SdmmcConfig::default()
        },
        MockState {
            card: Some(VirtualCard::emmc().without_device_type(EXT_CSD_CARD_TYPE_HS400_1_8V)),
            present: true,
            tuning_passes: false,
            ..MockState::default()
        },
    );

    controller.setup_card().unwrap();
    // Negotiation itself must not fail just because the top tier did.
    controller.tune_performance().unwrap();

    let card_state = controller.card_state().unwrap();
    assert_eq!(card_state.timing, MmcTiming::MmcHs);

    let st = state.lock().unwrap();
    assert_eq!(st.tuning_calls, 1);
    // A failed tuning run resets the sampling circuitry instead of
    // picking an arbitrary tap.
    assert_eq!(st.sampling_resets, 1);

    // The failed tier's flag stays cleared.
    assert_eq!(controller.capabilities() & MMC_TIMING_MMC_HS200, 0);
}

#[test]
fn sd_card_identifies_and_reaches_high_speed() {
    let (controller, _state) = attach_mock(
        default_caps(),
        SdmmcConfig::default(),
        MockState {
            card: Some(VirtualCard::sd()),
            present: true,
            tuning_passes: true,
            ..MockState::default()
        },
    );

    controller.setup_card().unwrap();
    controller.tune_performance().unwrap();

    let card_state = controller.card_state().unwrap();
    assert_eq!(card_state.timing, MmcTiming::SdHs);
    assert_eq!(card_state.bus_width, MmcBusWidth::Width4);

    // SDHC capacity parsed from the CSD.
    let sectors = controller.card_sectors().unwrap();
    assert_eq!(sectors, (0x3B37 + 1) * 1024);

    assert_ne!(controller.capabilities() & MMC_CAP_HIGH_CAPACITY, 0);
}

#[test]
fn config_timing_limit_narrows_before_identification() {
    let caps = default_caps() | MMC_TIMING_MMC_HS200 | MMC_TIMING_MMC_DDR52;
    let config = SdmmcConfig::parse("emmc,timing=hs").unwrap();
    let (controller, state) = attach_mock(
        caps,
        config,
        MockState {
            card: Some(VirtualCard::emmc()),
            present: true,
            tuning_passes: true,
            ..MockState::default()
        },
    );

    controller.setup_card().unwrap();
    controller.tune_performance().unwrap();

    // Both the tuned tiers and DDR were withheld by configuration.
    assert_eq!(controller.card_state().unwrap().timing, MmcTiming::MmcHs);
    assert_eq!(state.lock().unwrap().tuning_calls, 0);
}

#[test]
fn block_io_round_trip() {
    let (controller, _state) = attach_mock(
        default_caps(),
        SdmmcConfig::default(),
        MockState {
            card: Some(VirtualCard::sd()),
            present: true,
            tuning_passes: true,
            ..MockState::default()
        },
    );

    controller.setup_card().unwrap();
    controller.tune_performance().unwrap();

    let mut buf = vec![0u8; 4096];
    let sg = sdmmc_protocol::sdmmc::sg::SgList::single(buf.as_mut_ptr() as u64, 4096);
    controller.read_blocks(0, 8, sg).unwrap();
    // The virtual card fills reads with a fixed pattern.
    assert!(buf.iter().all(|b| *b == 0xA5));

    let sg = sdmmc_protocol::sdmmc::sg::SgList::single(buf.as_ptr() as u64, 4096);
    controller.write_blocks(8, 8, sg).unwrap();

    controller.erase_blocks(0, 1024).unwrap();

    // Size mismatches are rejected before anything is programmed.
    let sg = sdmmc_protocol::sdmmc::sg::SgList::single(buf.as_ptr() as u64, 4096);
    assert!(controller.read_blocks(0, 7, sg).is_err());
}
