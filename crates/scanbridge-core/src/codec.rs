//! Broker-backed capability container codec.
//!
//! The byte layouts live in `scanbridge_proto::container`; this module owns
//! the buffers. Encoding allocates a block through the source's memory
//! broker and writes the container into it. Decoding adopts the block the
//! source returned, materializes one [`ValueSlot`] per item (a Range gets
//! exactly five, plus a raw copy of its record), then unlocks and frees the
//! block exactly once, whether or not decoding succeeded.

use std::sync::Arc;

use scanbridge_proto::{
    CapValue, CapabilityId, Container, ContainerShape, ItemType, ProtocolError, RangeRecord,
    container::ContainerView, payloads::CapabilityRecord,
};

use crate::{
    error::CapabilityError,
    memory::{MemoryBroker, ScopedBuffer, ValueSlot},
};

/// A decoded container plus the raw Range record, for Range containers.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedContainer {
    /// Values in application form
    pub container: Container,
    /// Raw record exactly as the source wrote it
    pub range_record: Option<RangeRecord>,
}

/// Shape information obtained without decoding any value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerProbe {
    /// Container shape
    pub shape: ContainerShape,
    /// Item type the header reports
    pub item_type: ItemType,
    /// Item count (five for a Range)
    pub count: usize,
}

/// Encodes and decodes containers through one memory broker.
#[derive(Debug, Clone)]
pub struct CapabilityCodec {
    memory: Arc<dyn MemoryBroker>,
}

impl CapabilityCodec {
    /// Codec allocating from `memory`.
    pub fn new(memory: Arc<dyn MemoryBroker>) -> Self {
        Self { memory }
    }

    /// Broker the codec allocates from.
    pub fn memory(&self) -> &Arc<dyn MemoryBroker> {
        &self.memory
    }

    /// Encode a container into a freshly allocated, unlocked block.
    ///
    /// Range containers always carry the "don't care" default.
    pub fn encode(&self, container: &Container) -> Result<ScopedBuffer, CapabilityError> {
        let bytes = container.encode()?;
        let buffer = ScopedBuffer::allocate(&self.memory, bytes.len())?;
        buffer.lock()?.write(0, &bytes)?;
        Ok(buffer)
    }

    /// Decode the container a source returned and release its block.
    ///
    /// `requested` follows [`ItemType::resolve`]. Resolution happens before
    /// any slot is allocated, so an unknown item type allocates nothing.
    pub fn decode(
        &self,
        record: &CapabilityRecord,
        requested: ItemType,
    ) -> Result<DecodedContainer, CapabilityError> {
        let cap = record.cap;
        let handle = record.container.ok_or(CapabilityError::NullContainer(cap))?;
        let buffer = ScopedBuffer::adopt(&self.memory, handle);
        let shape = ContainerShape::from_u16(record.con_type)?;

        let (item_type, slots, indices, range_record, default_is_dontcare) = {
            let guard = buffer.lock()?;
            let bytes = guard.bytes()?;
            let view = ContainerView::parse(shape, &bytes)?;
            let item_type = view.effective_type(requested).map_err(|err| unknown_type(cap, err))?;

            let slots = (0..view.count())
                .map(|index| -> Result<ValueSlot, CapabilityError> {
                    let raw = view.item_bytes(item_type, index)?;
                    Ok(ValueSlot::materialize(&self.memory, item_type, raw)?)
                })
                .collect::<Result<Vec<_>, _>>()?;

            (
                item_type,
                slots,
                (view.current_index(), view.default_index()),
                view.range_record(),
                view.default_is_dontcare(),
            )
        };
        buffer.release()?;

        let values = slots
            .into_iter()
            .map(ValueSlot::into_value)
            .collect::<Result<Vec<_>, _>>()?;

        let container = match shape {
            ContainerShape::OneValue => Container::OneValue {
                item_type,
                value: values.into_iter().next().ok_or(ProtocolError::Empty("OneValue"))?,
            },
            ContainerShape::Array => Container::Array { item_type, values },
            ContainerShape::Enumeration => Container::Enumeration {
                item_type,
                values,
                current_index: indices.0,
                default_index: indices.1,
            },
            ContainerShape::Range => {
                let [min, max, step, default, current] = range_slots(values)?;
                Container::Range {
                    item_type,
                    min,
                    max,
                    step,
                    current,
                    default: if default_is_dontcare { None } else { Some(default) },
                }
            },
        };

        Ok(DecodedContainer { container, range_record })
    }

    /// Inspect shape and reported item type only, then release the block.
    pub fn probe(&self, record: &CapabilityRecord) -> Result<ContainerProbe, CapabilityError> {
        let handle = record.container.ok_or(CapabilityError::NullContainer(record.cap))?;
        let buffer = ScopedBuffer::adopt(&self.memory, handle);
        let shape = ContainerShape::from_u16(record.con_type)?;

        let bytes = buffer.read_all()?;
        let view = ContainerView::parse(shape, &bytes)?;
        let probe = ContainerProbe { shape, item_type: view.reported_type(), count: view.count() };

        buffer.release()?;
        Ok(probe)
    }

    /// Release a container a failed call left behind, if any.
    pub fn discard(&self, record: &CapabilityRecord) {
        if let Some(handle) = record.container {
            if self.memory.contains(handle) {
                drop(ScopedBuffer::adopt(&self.memory, handle));
            }
        }
    }
}

fn unknown_type(cap: CapabilityId, err: ProtocolError) -> CapabilityError {
    match err {
        ProtocolError::UnknownItemType(item_type) => CapabilityError::UnknownItemType { cap, item_type },
        other => CapabilityError::Codec(other),
    }
}

fn range_slots(values: Vec<CapValue>) -> Result<[CapValue; 5], ProtocolError> {
    let available = values.len();
    values
        .try_into()
        .map_err(|_| ProtocolError::Truncated { needed: RangeRecord::SLOTS, available })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use scanbridge_proto::container::DONTCARE32;

    use super::*;
    use crate::memory::{LegacyMemory, NegotiatedMemory};

    fn legacy_codec() -> (CapabilityCodec, Arc<dyn MemoryBroker>) {
        let memory: Arc<dyn MemoryBroker> = Arc::new(LegacyMemory::new());
        (CapabilityCodec::new(Arc::clone(&memory)), memory)
    }

    /// Encode as the source would and hand ownership over in a record.
    fn source_reply(codec: &CapabilityCodec, cap: CapabilityId, container: &Container) -> CapabilityRecord {
        let buffer = codec.encode(container).unwrap();
        let handle = buffer.handle();
        std::mem::forget(buffer);
        CapabilityRecord::with_container(cap, container.shape(), handle)
    }

    #[test]
    fn decode_releases_container_and_slots() {
        let (codec, memory) = legacy_codec();
        let container = Container::Enumeration {
            item_type: ItemType::UInt16,
            values: vec![CapValue::UInt16(0), CapValue::UInt16(2), CapValue::UInt16(5)],
            current_index: 1,
            default_index: 0,
        };
        let record = source_reply(&codec, CapabilityId::ICAP_PIXELTYPE, &container);

        let decoded = codec.decode(&record, ItemType::Unknown).unwrap();
        assert_eq!(decoded.container, container);
        assert_eq!(decoded.range_record, None);

        let stats = memory.stats();
        // One container block plus one slot per item
        assert_eq!(stats.allocations, 4);
        assert_eq!(stats.frees, 4);
        assert_eq!(stats.locks, stats.unlocks);
        assert_eq!(stats.rejected_frees, 0);
    }

    #[test]
    fn range_keeps_raw_record_and_five_slots() {
        let memory: Arc<dyn MemoryBroker> = Arc::new(NegotiatedMemory::new());
        let codec = CapabilityCodec::new(Arc::clone(&memory));
        let container = Container::Range {
            item_type: ItemType::Fix32,
            min: CapValue::Fix32(50.0),
            max: CapValue::Fix32(600.0),
            step: CapValue::Fix32(0.5),
            current: CapValue::Fix32(300.0),
            default: Some(CapValue::Fix32(200.0)),
        };
        let record = source_reply(&codec, CapabilityId::ICAP_XRESOLUTION, &container);

        let decoded = codec.decode(&record, ItemType::Unknown).unwrap();
        let raw = decoded.range_record.unwrap();
        assert_eq!(raw.slots()[3], DONTCARE32);
        assert!(matches!(decoded.container, Container::Range { default: None, .. }));
        assert_eq!(memory.stats().allocations, 1 + 5);
        assert_eq!(memory.stats().live(), 0);
    }

    #[test]
    fn null_container_is_an_error() {
        let (codec, _) = legacy_codec();
        let record = CapabilityRecord::request(CapabilityId::XFERCOUNT);
        assert_eq!(
            codec.decode(&record, ItemType::Unknown).unwrap_err(),
            CapabilityError::NullContainer(CapabilityId::XFERCOUNT)
        );
    }

    #[test]
    fn unknown_item_type_allocates_no_slots() {
        let (codec, memory) = legacy_codec();
        let buffer = ScopedBuffer::allocate(&memory, 6).unwrap();
        buffer.lock().unwrap().write(0, &[0x42, 0x00, 1, 0, 0, 0]).unwrap();
        let handle = buffer.handle();
        std::mem::forget(buffer);
        let record = CapabilityRecord::with_container(CapabilityId(0x8001), ContainerShape::OneValue, handle);

        let err = codec.decode(&record, ItemType::Unknown).unwrap_err();
        assert_eq!(err, CapabilityError::UnknownItemType { cap: CapabilityId(0x8001), item_type: 0x42 });

        let stats = memory.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);
    }

    #[test]
    fn requested_type_overrides_header() {
        let (codec, _) = legacy_codec();
        let container = Container::one(ItemType::UInt16, CapValue::UInt16(0xfffe));
        let record = source_reply(&codec, CapabilityId::XFERCOUNT, &container);

        let decoded = codec.decode(&record, ItemType::Int16).unwrap();
        assert_eq!(decoded.container, Container::one(ItemType::Int16, CapValue::Int16(-2)));
    }

    #[test]
    fn probe_reads_shape_without_slots() {
        let (codec, memory) = legacy_codec();
        let container = Container::Array {
            item_type: ItemType::UInt16,
            values: vec![CapValue::UInt16(1), CapValue::UInt16(2)],
        };
        let record = source_reply(&codec, CapabilityId::CAP_SUPPORTEDCAPS, &container);

        let probe = codec.probe(&record).unwrap();
        assert_eq!(
            probe,
            ContainerProbe { shape: ContainerShape::Array, item_type: ItemType::UInt16, count: 2 }
        );
        assert_eq!(memory.stats().allocations, 1);
        assert_eq!(memory.stats().live(), 0);
    }

    #[test]
    fn failed_decode_still_frees_the_container() {
        let (codec, memory) = legacy_codec();
        let buffer = ScopedBuffer::allocate(&memory, 3).unwrap();
        let handle = buffer.handle();
        std::mem::forget(buffer);
        // Too short for an Array header
        let record = CapabilityRecord::with_container(CapabilityId::XFERCOUNT, ContainerShape::Array, handle);

        assert!(matches!(codec.decode(&record, ItemType::Unknown), Err(CapabilityError::Codec(_))));
        assert_eq!(memory.stats().live(), 0);
    }

    fn array() -> impl Strategy<Value = Container> {
        prop::collection::vec(any::<i32>().prop_map(CapValue::Int32), 0..16)
            .prop_map(|values| Container::Array { item_type: ItemType::Int32, values })
    }

    proptest! {
        #[test]
        fn every_block_is_freed_once_and_unlocked_first(
            containers in prop::collection::vec(array(), 1..8),
            negotiated in any::<bool>(),
        ) {
            let memory: Arc<dyn MemoryBroker> = if negotiated {
                Arc::new(NegotiatedMemory::new())
            } else {
                Arc::new(LegacyMemory::new())
            };
            let codec = CapabilityCodec::new(Arc::clone(&memory));

            for container in &containers {
                let record = source_reply(&codec, CapabilityId::CAP_SUPPORTEDCAPS, container);
                let decoded = codec.decode(&record, ItemType::Unknown).unwrap();
                prop_assert_eq!(&decoded.container, container);
            }

            let stats = memory.stats();
            prop_assert_eq!(stats.frees, stats.allocations);
            prop_assert_eq!(stats.rejected_frees, 0);
            prop_assert_eq!(stats.live(), 0);
        }
    }
}
