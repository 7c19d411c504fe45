//! Property tests for capability values written to and read back from a
//! device through both memory tables.
//!
//! Every case checks that the value survives the trip and that no block
//! is left allocated afterwards.

use std::sync::Arc;

use proptest::prelude::*;
use scanbridge_core::{
    AcquisitionConfig, ContainerPreference, GetKind, MemoryBroker, Session, SessionConfig,
};
use scanbridge_harness::{SimCapability, SimDevice, SimDriver};
use scanbridge_proto::{CapValue, CapabilityId, Container, ItemType};

const CUSTOM: CapabilityId = CapabilityId(0x8100);

fn item() -> impl Strategy<Value = (ItemType, CapValue)> {
    prop_oneof![
        any::<i8>().prop_map(|v| (ItemType::Int8, CapValue::Int8(v))),
        any::<i16>().prop_map(|v| (ItemType::Int16, CapValue::Int16(v))),
        any::<i32>().prop_map(|v| (ItemType::Int32, CapValue::Int32(v))),
        any::<u8>().prop_map(|v| (ItemType::UInt8, CapValue::UInt8(v))),
        any::<u16>().prop_map(|v| (ItemType::UInt16, CapValue::UInt16(v))),
        any::<u32>().prop_map(|v| (ItemType::UInt32, CapValue::UInt32(v))),
        any::<bool>().prop_map(|v| (ItemType::Bool, CapValue::Bool(v))),
        (any::<i16>(), any::<u16>()).prop_map(|(whole, frac)| {
            (ItemType::Fix32, CapValue::Fix32(f64::from(whole) + f64::from(frac) / 65536.0))
        }),
        "[a-zA-Z0-9 ]{0,31}".prop_map(|v| (ItemType::Str32, CapValue::Str(v))),
        "[a-zA-Z0-9 ]{0,250}".prop_map(|v| (ItemType::Str255, CapValue::Str(v))),
    ]
}

fn array_of(item_type: ItemType) -> BoxedStrategy<Vec<CapValue>> {
    match item_type {
        ItemType::UInt16 => prop::collection::vec(any::<u16>().prop_map(CapValue::UInt16), 1..32).boxed(),
        ItemType::Int32 => prop::collection::vec(any::<i32>().prop_map(CapValue::Int32), 1..32).boxed(),
        _ => prop::collection::vec("[a-z]{1,20}".prop_map(CapValue::Str), 1..8).boxed(),
    }
}

fn device_with(item_type: ItemType, initial: CapValue, legacy: bool) -> Arc<SimDriver> {
    let device = SimDevice::flatbed("Codec").with_capability(CUSTOM, SimCapability::one(item_type, initial));
    let device = if legacy { device.legacy() } else { device };
    SimDriver::new([device])
}

fn open(driver: &Arc<SimDriver>) -> Session {
    let config = SessionConfig { log_triplets: false, ..SessionConfig::default() };
    let mut session = driver.open_session(config).unwrap();
    session.open_source("Codec", AcquisitionConfig::default()).unwrap();
    session
}

fn memory_of(driver: &SimDriver, legacy: bool) -> Arc<dyn MemoryBroker> {
    if legacy {
        Arc::clone(driver.os_memory()) as Arc<dyn MemoryBroker>
    } else {
        Arc::clone(driver.negotiated_memory()) as Arc<dyn MemoryBroker>
    }
}

proptest! {
    #[test]
    fn single_value_survives_the_trip((item_type, value) in item(), legacy in any::<bool>()) {
        let driver = device_with(item_type, value.clone(), legacy);
        let mut session = open(&driver);
        let source = session.source_mut("Codec").unwrap();

        source.set_value(CUSTOM, item_type, vec![value.clone()], ContainerPreference::OneValue).unwrap();
        prop_assert_eq!(driver.current_value("Codec", CUSTOM), Some(value.clone()));

        let read = source.get_value(CUSTOM, GetKind::GetCurrent, item_type).unwrap();
        prop_assert_eq!(read, Container::one(item_type, value));

        prop_assert_eq!(memory_of(&driver, legacy).stats().live(), 0);
    }

    #[test]
    fn array_survives_the_trip(
        (item_type, values) in prop_oneof![Just(ItemType::UInt16), Just(ItemType::Int32), Just(ItemType::Str64)]
            .prop_flat_map(|item_type| (Just(item_type), array_of(item_type))),
        legacy in any::<bool>(),
    ) {
        let driver = device_with(item_type, values[0].clone(), legacy);
        let mut session = open(&driver);
        let source = session.source_mut("Codec").unwrap();

        source.set_value(CUSTOM, item_type, values.clone(), ContainerPreference::Array).unwrap();
        let read = source.get_value(CUSTOM, GetKind::Get, ItemType::Unknown).unwrap();
        prop_assert_eq!(read, Container::Array { item_type, values });
        prop_assert_eq!(memory_of(&driver, legacy).stats().live(), 0);
    }

    #[test]
    fn written_container_matches_what_was_asked(values in array_of(ItemType::UInt16)) {
        let driver = device_with(ItemType::UInt16, CapValue::UInt16(0), false);
        let mut session = open(&driver);

        session
            .source_mut("Codec")
            .unwrap()
            .set_constraint(CUSTOM, ItemType::UInt16, values.clone(), ContainerPreference::Enumeration)
            .unwrap();

        let writes = driver.capability_writes("Codec");
        prop_assert_eq!(writes.len(), 1);
        prop_assert_eq!(
            &writes[0].container,
            &Container::Enumeration { item_type: ItemType::UInt16, values, current_index: 0, default_index: 0 }
        );
    }
}
